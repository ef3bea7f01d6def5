//! The plan engine: owns collector instances and does the real work of
//! collecting metrics.
//!
//! The level collector decides *when* to collect; the engine knows *how*.
//! `prepare` builds the level → collectors mapping for a plan and commits
//! it between the caller's pause/commit callbacks, so the tick loop never
//! observes a half-applied plan. `collect` fans out to the collectors at
//! one level under a read lock, bounded by a small semaphore.

use chrono::Utc;
use dbpulse_collector::{Collector, CollectorFactory, FactoryArgs};
use dbpulse_common::event::{self, MonitorEmitter};
use dbpulse_common::types::MetricRecord;
use dbpulse_db::DbConn;
use dbpulse_plan::Plan;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const PING_RETRY_WAIT: Duration = Duration::from_secs(2);

/// Concurrent collector tasks per collection pass. Matches the level
/// collector's own parallelism.
const COLLECT_PARALLEL: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The stop signal arrived while preparing; nothing was applied.
    #[error("engine: prepare canceled")]
    Canceled,

    #[error("engine: collector {domain}: {message}")]
    Collector { domain: String, message: String },
}

#[derive(Default)]
struct EngineState {
    ready: bool,
    plan_name: String,
    /// Keyed on level name: the collectors to run at that level.
    at_level: HashMap<String, Vec<Arc<dyn Collector>>>,
}

pub struct Engine {
    monitor_id: String,
    db: Arc<dyn DbConn>,
    factory: Arc<dyn CollectorFactory>,
    emitter: MonitorEmitter,
    /// Keyed on domain; instances are created once and reused across
    /// prepares.
    collectors: Mutex<HashMap<String, Arc<dyn Collector>>>,
    state: RwLock<EngineState>,
    connected: AtomicBool,
    sem: Arc<Semaphore>,
}

impl Engine {
    pub fn new(
        monitor_id: &str,
        db: Arc<dyn DbConn>,
        factory: Arc<dyn CollectorFactory>,
    ) -> Self {
        Self {
            monitor_id: monitor_id.to_string(),
            db,
            factory,
            emitter: MonitorEmitter::new(monitor_id),
            collectors: Mutex::new(HashMap::new()),
            state: RwLock::new(EngineState::default()),
            connected: AtomicBool::new(false),
            sem: Arc::new(Semaphore::new(COLLECT_PARALLEL)),
        }
    }

    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    pub fn db(&self) -> Arc<dyn DbConn> {
        self.db.clone()
    }

    /// Prepare the engine to collect `plan`.
    ///
    /// Ensures a live connection (retrying until `stop`), creates or
    /// reuses the collector for every domain in the plan and prepares it,
    /// then commits: `on_pause()`, swap the level mapping, `on_commit()`.
    ///
    /// Not safe for concurrent calls; the level collector's plan-swap
    /// path is the only caller and serializes them.
    pub async fn prepare(
        &self,
        stop: &CancellationToken,
        plan: &Plan,
        on_pause: &(dyn Fn() + Send + Sync),
        on_commit: &(dyn Fn() + Send + Sync),
    ) -> Result<(), EngineError> {
        self.emitter.send(event::ENGINE_PREPARE_PLAN, plan.name.clone());

        if !self.connected.load(Ordering::Acquire) {
            self.emitter.send(event::ENGINE_CONNECTING, self.monitor_id.clone());
            loop {
                if let Ok(Ok(())) = tokio::time::timeout(PING_TIMEOUT, self.db.ping()).await {
                    self.connected.store(true, Ordering::Release);
                    self.emitter.send(event::ENGINE_CONNECTED, self.monitor_id.clone());
                    break;
                }
                tokio::select! {
                    _ = stop.cancelled() => return Err(EngineError::Canceled),
                    _ = tokio::time::sleep(PING_RETRY_WAIT) => {}
                }
            }
        }

        let mut at_level: HashMap<String, Vec<Arc<dyn Collector>>> = HashMap::new();
        for (level_name, level) in &plan.levels {
            for domain in level.collect.keys() {
                let mc = self.collector_for(domain)?;
                mc.prepare(plan).await.map_err(|e| EngineError::Collector {
                    domain: domain.clone(),
                    message: e.to_string(),
                })?;
                at_level.entry(level_name.clone()).or_default().push(mc);

                if stop.is_cancelled() {
                    return Err(EngineError::Canceled);
                }
            }
        }

        on_pause();
        {
            let mut state = self.state.write().await;
            state.at_level = at_level;
            state.plan_name = plan.name.clone();
            state.ready = true;
        }
        on_commit();

        tracing::debug!(monitor_id = %self.monitor_id, plan = %plan.name, "engine ready");
        Ok(())
    }

    /// Collect all metrics at one level.
    ///
    /// Returns `Ok(None)` when no plan is prepared or the level has no
    /// collectors. A single collector failure (or panic) contributes an
    /// empty slice for its domain; the other domains proceed. The record's
    /// `begin`/`end` wrap the whole fan-out.
    pub async fn collect(&self, level_name: &str) -> Result<Option<MetricRecord>, EngineError> {
        // Hold the read lock for the whole fan-out so prepare cannot swap
        // the plan out from under a pass in flight.
        let state = self.state.read().await;
        if !state.ready {
            tracing::debug!(monitor_id = %self.monitor_id, "engine not ready");
            return Ok(None);
        }
        let Some(mcs) = state.at_level.get(level_name) else {
            tracing::debug!(monitor_id = %self.monitor_id, level = level_name, "no collectors at level");
            return Ok(None);
        };

        let mut record = MetricRecord {
            monitor_id: self.monitor_id.clone(),
            plan: state.plan_name.clone(),
            level: level_name.to_string(),
            state: String::new(),
            begin: Utc::now(),
            end: Utc::now(),
            values: HashMap::with_capacity(mcs.len()),
        };

        let mut tasks = JoinSet::new();
        for mc in mcs {
            let mc = mc.clone();
            let sem = self.sem.clone();
            let level = level_name.to_string();
            tasks.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore never closed");
                let domain = mc.domain();
                let result = AssertUnwindSafe(mc.collect(&level))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("collector panicked")));
                (domain, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((domain, Ok(values))) => {
                    record.values.insert(domain.to_string(), values);
                }
                Ok((domain, Err(e))) => {
                    tracing::warn!(
                        monitor_id = %self.monitor_id,
                        domain,
                        level = level_name,
                        error = %e,
                        "collector failed"
                    );
                    record.values.insert(domain.to_string(), Vec::new());
                }
                Err(e) => {
                    tracing::warn!(monitor_id = %self.monitor_id, error = %e, "collector task failed");
                }
            }
        }

        record.end = Utc::now();
        Ok(Some(record))
    }

    fn collector_for(&self, domain: &str) -> Result<Arc<dyn Collector>, EngineError> {
        let mut collectors = self.collectors.lock().unwrap();
        if let Some(mc) = collectors.get(domain) {
            return Ok(mc.clone());
        }
        let args = FactoryArgs {
            monitor_id: self.monitor_id.clone(),
            db: self.db.clone(),
        };
        let mc = self
            .factory
            .make(domain, &args)
            .map_err(|e| EngineError::Collector {
                domain: domain.to_string(),
                message: e.to_string(),
            })?;
        collectors.insert(domain.to_string(), mc.clone());
        Ok(mc)
    }
}
