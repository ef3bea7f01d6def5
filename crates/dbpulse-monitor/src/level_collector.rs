//! The level collector (LPC): drives metrics collection for one monitor.
//!
//! Every whole-second tick it decides which plan level (if any) is due
//! and asks the engine to collect it, then hands the record to the
//! configured sinks. It does not collect anything itself. Plan swaps
//! arrive through [`LevelCollector::change_plan`], called by the level
//! adjuster (or once at monitor start when adjusting is disabled), and
//! commit through the engine's two-phase prepare so no tick ever runs
//! under a half-applied plan.

use crate::engine::{Engine, EngineError};
use crate::TransformMetricsFn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dbpulse_common::config::MonitorConfig;
use dbpulse_common::event::{self, MonitorEmitter};
use dbpulse_common::types::{CollectorStatus, State};
use dbpulse_plan::loader::PlanLoader;
use dbpulse_plan::sorted::{level_at_tick, sorted_levels, SortedLevel};
use dbpulse_sink::Sink;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default tick period. Constructor-overridable so tests can compress
/// time.
pub const TICKER_DURATION: Duration = Duration::from_secs(1);

/// Concurrent collection passes per monitor. Collection is async so one
/// slow pass (a big level on a slow instance) does not stall the tick
/// loop; two slots are plenty, and more usually means an underlying
/// problem worth surfacing instead of hiding.
pub const MAX_COLLECTORS: usize = 2;

const PLAN_LOAD_RETRY_WAIT: Duration = Duration::from_secs(2);
const PREPARE_TIMEOUT: Duration = Duration::from_secs(10);
const PREPARE_BACKOFF_BASE: Duration = Duration::from_millis(500);
const PREPARE_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ChangePlanError {
    #[error("level collector is stopped")]
    Stopped,
}

/// The control surface the level adjuster drives. Split out as a trait so
/// the adjuster's state machine can be tested against a recording stub.
#[async_trait]
pub trait CollectorControl: Send + Sync {
    /// Request that subsequent ticks run under `(new_state, new_plan_name)`.
    /// Non-blocking: the swap itself runs in the background; the last
    /// request always wins.
    async fn change_plan(
        &self,
        new_state: State,
        new_plan_name: &str,
    ) -> Result<(), ChangePlanError>;

    /// Freeze collection. Only `change_plan` resumes it.
    fn pause(&self);
}

pub struct LevelCollectorArgs {
    pub config: MonitorConfig,
    pub engine: Arc<Engine>,
    pub plan_loader: Arc<PlanLoader>,
    pub sinks: Vec<Arc<dyn Sink>>,
    pub transform_metrics: Option<TransformMetricsFn>,
    pub ticker_duration: Duration,
}

#[derive(Default)]
struct LpcState {
    state: Option<State>,
    plan_name: String,
    levels: Vec<SortedLevel>,
    paused: bool,
    stopped: bool,
}

#[derive(Default)]
struct Stats {
    last_collect_ts: Option<DateTime<Utc>>,
    last_collect_error: Option<String>,
    last_collect_error_ts: Option<DateTime<Utc>>,
    sink_errors: HashMap<String, String>,
}

struct SwapTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: MonitorConfig,
    monitor_id: String,
    engine: Arc<Engine>,
    plan_loader: Arc<PlanLoader>,
    sinks: Vec<Arc<dyn Sink>>,
    transform_metrics: Option<TransformMetricsFn>,
    emitter: MonitorEmitter,
    ticker_duration: Duration,
    sem: Arc<Semaphore>,
    state: Mutex<LpcState>,
    stats: Mutex<Stats>,
    /// Serializes plan-swap requests; holds the in-flight swap task.
    change: AsyncMutex<Option<SwapTask>>,
}

pub struct LevelCollector {
    inner: Arc<Inner>,
}

impl LevelCollector {
    pub fn new(args: LevelCollectorArgs) -> Self {
        let monitor_id = args.config.monitor_id();
        Self {
            inner: Arc::new(Inner {
                monitor_id: monitor_id.clone(),
                config: args.config,
                engine: args.engine,
                plan_loader: args.plan_loader,
                sinks: args.sinks,
                transform_metrics: args.transform_metrics,
                emitter: MonitorEmitter::new(monitor_id),
                ticker_duration: args.ticker_duration,
                sem: Arc::new(Semaphore::new(MAX_COLLECTORS)),
                state: Mutex::new(LpcState {
                    paused: true, // nothing to collect until the first plan commits
                    ..Default::default()
                }),
                stats: Mutex::new(Stats::default()),
                change: AsyncMutex::new(None),
            }),
        }
    }

    /// The tick loop. Blocking: returns when `stop` is cancelled, after
    /// cancelling any in-flight plan swap. Stopping twice is harmless.
    pub async fn run(&self, stop: CancellationToken) {
        let inner = &self.inner;
        let mut ticker = tokio::time::interval(inner.ticker_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // s counts whole-second ticks. Modulo against the sorted level
        // frequencies picks the level due at each tick, so any number of
        // levels coexist without per-level timers. Reset to -1 on pause:
        // the first tick after a plan commit is s=0, which always fires
        // the finest level, so collection restarts deterministically.
        let mut s: i64 = -1;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            s += 1;

            let (plan_name, level_name) = {
                let mut state = inner.state.lock().unwrap();
                if state.paused {
                    s = -1;
                    continue;
                }
                match level_at_tick(&state.levels, s) {
                    None => continue, // nothing to collect this second
                    Some(level) => (state.plan_name.clone(), level.name.clone()),
                }
            };

            match inner.sem.clone().try_acquire_owned() {
                Ok(permit) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let pass = collect_and_send(&inner, &level_name);
                        if let Err(panic) = AssertUnwindSafe(pass).catch_unwind().await {
                            let msg = format!(
                                "PANIC: {}: {}/{}: {}",
                                inner.monitor_id,
                                plan_name,
                                level_name,
                                panic_message(&panic)
                            );
                            set_err(&inner, Some(msg), Some(event::LPC_PANIC));
                        }
                    });
                }
                Err(_) => {
                    // All collection slots busy; drop the tick.
                    let msg = format!(
                        "cannot collect {plan_name}/{level_name}: \
                         {MAX_COLLECTORS} of {MAX_COLLECTORS} collectors still running"
                    );
                    set_err(inner, Some(msg), Some(event::LPC_BLOCKED));
                }
            }
        }

        // Stopping: refuse new swaps, then cancel the in-flight one.
        inner.state.lock().unwrap().stopped = true;
        let mut change = inner.change.lock().await;
        if let Some(task) = change.take() {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
        tracing::debug!(monitor_id = %inner.monitor_id, "level collector stopped");
    }

    /// Snapshot of internal status, returned by value.
    pub fn status(&self) -> CollectorStatus {
        let state = self.inner.state.lock().unwrap();
        let stats = self.inner.stats.lock().unwrap();
        CollectorStatus {
            state: state.state,
            plan: state.plan_name.clone(),
            paused: state.paused,
            last_collect_ts: stats.last_collect_ts,
            last_collect_error: stats.last_collect_error.clone(),
            last_collect_error_ts: stats.last_collect_error_ts,
            sink_errors: stats.sink_errors.clone(),
        }
    }
}

#[async_trait]
impl CollectorControl for LevelCollector {
    /// Serialized; the last call wins. An in-flight swap is cancelled and
    /// awaited before the new one starts, so at most one swap task exists
    /// at a time. Fails only after the collector has stopped.
    async fn change_plan(
        &self,
        new_state: State,
        new_plan_name: &str,
    ) -> Result<(), ChangePlanError> {
        let mut change = self.inner.change.lock().await;
        if self.inner.state.lock().unwrap().stopped {
            return Err(ChangePlanError::Stopped);
        }
        if let Some(prev) = change.take() {
            prev.cancel.cancel();
            let _ = prev.handle.await;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(swap_plan(
            self.inner.clone(),
            cancel.clone(),
            new_state,
            new_plan_name.to_string(),
        ));
        *change = Some(SwapTask { cancel, handle });
        Ok(())
    }

    fn pause(&self) {
        tracing::debug!(monitor_id = %self.inner.monitor_id, "pause");
        self.inner.state.lock().unwrap().paused = true;
    }
}

/// One collection pass: engine collect, transform, fan to sinks.
async fn collect_and_send(inner: &Arc<Inner>, level_name: &str) {
    let collected = inner.engine.collect(level_name).await;

    let maybe_record = match collected {
        Err(e) => {
            set_err(
                inner,
                Some(format!("{e}; see monitor status or event log for details")),
                Some(event::ENGINE_COLLECT_ERROR),
            );
            return;
        }
        Ok(maybe) => {
            set_err(inner, None, None);
            inner.stats.lock().unwrap().last_collect_ts = Some(Utc::now());
            maybe
        }
    };

    let Some(mut record) = maybe_record else {
        return; // not ready, or level unknown
    };

    record.state = {
        let state = inner.state.lock().unwrap();
        state.state.map(|s| s.as_str().to_string()).unwrap_or_default()
    };

    if let Some(transform) = &inner.transform_metrics {
        transform(&mut record);
    }

    // Sinks receive the record sequentially, in configured order. Sinks
    // are expected to be fast or internally async with their own
    // timeouts, and this pass already runs outside the tick loop.
    for sink in &inner.sinks {
        let name = sink.name().to_string();
        match sink.send(&record).await {
            Ok(()) => {
                inner.stats.lock().unwrap().sink_errors.remove(&name);
            }
            Err(e) => {
                let msg = format!("[{}] {e}", Utc::now());
                tracing::warn!(monitor_id = %inner.monitor_id, sink = %name, error = %e, "sink send failed");
                inner.stats.lock().unwrap().sink_errors.insert(name, msg);
            }
        }
    }
}

/// The plan-swap task, run by `change_plan`. Potentially long-running: it
/// retries forever (plan load every 2s, engine prepare with backoff)
/// until it succeeds or is cancelled by a newer swap or by stop. Plan
/// presence is the precondition for collecting anything, which is why
/// this is the one loop in the agent that never gives up.
async fn swap_plan(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    new_state: State,
    new_plan_name: String,
) {
    let change_desc = {
        let state = inner.state.lock().unwrap();
        format!(
            "state:{} plan:{} -> state:{} plan:{}",
            state.state.map(|s| s.as_str()).unwrap_or("-"),
            if state.plan_name.is_empty() { "-" } else { state.plan_name.as_str() },
            new_state,
            if new_plan_name.is_empty() { "(first)" } else { new_plan_name.as_str() },
        )
    };
    inner.emitter.send(event::CHANGE_PLAN_BEGIN, change_desc.clone());

    let mut plan = loop {
        match inner.plan_loader.plan(&inner.monitor_id, &new_plan_name) {
            Ok(plan) => break plan,
            Err(e) => {
                inner.emitter.error(
                    event::CHANGE_PLAN_ERROR,
                    format!(
                        "{change_desc}: error loading new plan: {e} \
                         (retry in {PLAN_LOAD_RETRY_WAIT:?})"
                    ),
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(PLAN_LOAD_RETRY_WAIT) => {}
                }
            }
        }
    };

    plan.monitor_id = inner.monitor_id.clone();
    plan.interpolate_env();
    plan.interpolate_monitor(&inner.config);
    let levels = sorted_levels(&mut plan);

    // Two-phase commit:
    //   0. pause the tick loop          (engine calls on_pause)
    //   1. engine commits the new plan
    //   2. publish state/plan/levels and resume (on_commit)
    // The tick loop is frozen while the engine mutates its collector set;
    // the instant it resumes, the engine is ready.
    let on_pause = {
        let inner = inner.clone();
        move || {
            inner.state.lock().unwrap().paused = true;
        }
    };
    let on_commit = {
        let inner = inner.clone();
        let plan_name = plan.name.clone();
        let levels = levels.clone();
        move || {
            let mut state = inner.state.lock().unwrap();
            state.state = Some(new_state);
            state.plan_name = plan_name.clone();
            state.levels = levels.clone();
            state.paused = false;
        }
    };

    let mut backoff = PREPARE_BACKOFF_BASE;
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            attempt = tokio::time::timeout(
                PREPARE_TIMEOUT,
                inner.engine.prepare(&cancel, &plan, &on_pause, &on_commit),
            ) => attempt,
        };

        match attempt {
            Ok(Ok(())) => break,
            Ok(Err(EngineError::Canceled)) => return,
            Ok(Err(e)) => {
                inner.emitter.error(
                    event::CHANGE_PLAN_ERROR,
                    format!("{change_desc}: error preparing new plan: {e}"),
                );
            }
            Err(_) => {
                inner.emitter.error(
                    event::CHANGE_PLAN_ERROR,
                    format!(
                        "{change_desc}: error preparing new plan: \
                         timeout after {PREPARE_TIMEOUT:?}"
                    ),
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(PREPARE_BACKOFF_MAX);
    }

    inner.emitter.send(event::CHANGE_PLAN_SUCCESS, change_desc);
}

fn set_err(inner: &Arc<Inner>, err: Option<String>, event_name: Option<&'static str>) {
    {
        let mut stats = inner.stats.lock().unwrap();
        match &err {
            Some(_) => stats.last_collect_error_ts = Some(Utc::now()),
            None => stats.last_collect_error_ts = None,
        }
        stats.last_collect_error = err.clone();
    }
    if let (Some(name), Some(msg)) = (event_name, err) {
        inner.emitter.error(name, msg);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
