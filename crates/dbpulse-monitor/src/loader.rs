//! The monitor loader: reconciles running monitors against the
//! configured sources.
//!
//! Sources are merged in order (later overrides earlier, keyed on
//! monitor id): inline config monitors, monitor files, cloud discovery,
//! and local auto-detect as a last resort — or a user plugin that
//! replaces them all. Reconciliation computes added/removed/changed sets
//! by content hash and applies them, guarded by the stop-loss brake: a
//! suspiciously large drop in monitor count refuses the whole change
//! rather than cascading a discovery outage into the metric pipeline.

use crate::ha::HaManager;
use crate::monitor::{Monitor, MonitorArgs};
use crate::{Plugins, TransformMetricsFn};
use async_trait::async_trait;
use dbpulse_collector::CollectorFactory;
use dbpulse_common::config::{
    parse_duration, parse_stop_loss, MonitorConfig, MonitorDefaults, StopLoss,
};
use dbpulse_common::event;
use dbpulse_db::DbFactory;
use dbpulse_plan::loader::PlanLoader;
use dbpulse_sink::SinkFactory;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Space out monitor starts so their tick clocks don't align; a fleet of
/// monitors waking on the same whole second makes CPU and network usage
/// spiky.
const START_SPACING: Duration = Duration::from_millis(20);

const LOCAL_DETECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Default socket paths and TCP endpoint tried by local auto-detect.
const LOCAL_SOCKETS: &[&str] = &["/tmp/mysql.sock", "/var/run/mysqld/mysqld.sock"];
const LOCAL_TCP: &str = "127.0.0.1:3306";

/// `monitor_loader` section of the agent config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorLoaderConfig {
    /// Monitor files (one monitor per TOML file).
    #[serde(default)]
    pub files: Vec<String>,
    /// Reload period; empty disables the reload loop.
    #[serde(default)]
    pub freq: String,
    /// `"50%"` or an absolute count; see [`parse_stop_loss`].
    #[serde(default)]
    pub stop_loss: String,
    /// Disable local auto-detect when no other source yields monitors.
    #[serde(default)]
    pub disable_auto_local: bool,
}

/// Cloud discovery hook (e.g. an RDS-style instance lister). Errors are
/// fatal in strict mode, logged and skipped otherwise.
#[async_trait]
pub trait CloudLoader: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<MonitorConfig>>;
}

/// Monitors added, removed, and changed by one reconcile pass.
#[derive(Debug, Default)]
pub struct Changes {
    pub added: Vec<MonitorConfig>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub invalid: Vec<String>,
}

struct LoadedMonitor {
    monitor: Arc<Monitor>,
    started: bool,
}

pub struct MonitorLoaderArgs {
    pub monitors: Vec<MonitorConfig>,
    pub loader_config: MonitorLoaderConfig,
    pub defaults: MonitorDefaults,
    pub strict: bool,
    pub db_factory: Arc<dyn DbFactory>,
    pub plan_loader: Arc<PlanLoader>,
    pub collector_factory: Arc<dyn CollectorFactory>,
    pub sink_factory: Arc<dyn SinkFactory>,
    pub ha: Arc<dyn HaManager>,
    pub plugins: Plugins,
    pub cloud: Option<Arc<dyn CloudLoader>>,
    pub ticker_duration: Duration,
}

pub struct MonitorLoader {
    monitors_cfg: Vec<MonitorConfig>,
    cfg: MonitorLoaderConfig,
    defaults: MonitorDefaults,
    strict: bool,
    stop_loss: StopLoss,
    db_factory: Arc<dyn DbFactory>,
    plan_loader: Arc<PlanLoader>,
    collector_factory: Arc<dyn CollectorFactory>,
    sink_factory: Arc<dyn SinkFactory>,
    ha: Arc<dyn HaManager>,
    plugins: Plugins,
    cloud: Option<Arc<dyn CloudLoader>>,
    ticker_duration: Duration,
    /// Keyed on monitor id. The async mutex also serializes load passes.
    monitors: Mutex<HashMap<String, LoadedMonitor>>,
}

impl MonitorLoader {
    pub fn new(args: MonitorLoaderArgs) -> anyhow::Result<Self> {
        let stop_loss =
            parse_stop_loss(&args.loader_config.stop_loss).map_err(|e| anyhow::anyhow!(e))?;
        Ok(Self {
            monitors_cfg: args.monitors,
            cfg: args.loader_config,
            defaults: args.defaults,
            strict: args.strict,
            stop_loss,
            db_factory: args.db_factory,
            plan_loader: args.plan_loader,
            collector_factory: args.collector_factory,
            sink_factory: args.sink_factory,
            ha: args.ha,
            plugins: args.plugins,
            cloud: args.cloud,
            ticker_duration: args.ticker_duration,
            monitors: Mutex::new(HashMap::new()),
        })
    }

    /// One reconcile pass: gather configs from all sources, diff against
    /// the running set, and apply (unless stop-loss refuses).
    pub async fn load(&self) -> anyhow::Result<()> {
        self.load_with_timeout(None).await
    }

    async fn load_with_timeout(&self, gather_timeout: Option<Duration>) -> anyhow::Result<()> {
        let mut monitors = self.monitors.lock().await;
        event::send(event::MONITORS_LOADING, "");

        let mut changes = Changes::default();
        let all = match gather_timeout {
            None => self.gather(&mut changes).await?,
            Some(t) => tokio::time::timeout(t, self.gather(&mut changes))
                .await
                .map_err(|_| anyhow::anyhow!("monitor sources did not load within {t:?}"))??,
        };

        // Diff against the running set.
        for id in monitors.keys() {
            if !all.contains_key(id) {
                changes.removed.push(id.clone());
            }
        }
        for (id, cfg) in &all {
            match monitors.get(id) {
                None => changes.added.push(cfg.clone()),
                Some(loaded) => {
                    // Content hash: any config change is a new monitor.
                    if loaded.monitor.config().content_hash() != cfg.content_hash() {
                        changes.changed.push(id.clone());
                        changes.added.push(cfg.clone());
                    }
                }
            }
        }

        // Stop-loss: refuse a suspiciously large drop.
        let before = monitors.len();
        let removed = changes.removed.len();
        if removed > 0 && before > 0 {
            let mut trip = None;
            if self.stop_loss.percent > 0.0 {
                let lost = removed as f64 / before as f64;
                if lost > self.stop_loss.percent {
                    trip = Some(format!(
                        "before: {before}; removed: {removed}; lost {:.0}% > limit {:.0}%",
                        lost * 100.0,
                        self.stop_loss.percent * 100.0
                    ));
                }
            }
            if self.stop_loss.number > 0 && removed as u64 > self.stop_loss.number {
                trip = Some(format!(
                    "before: {before}; removed: {removed}; lost {removed} > limit {}",
                    self.stop_loss.number
                ));
            }
            if let Some(msg) = trip {
                event::error(event::MONITORS_STOPLOSS, msg);
                event::send(event::MONITORS_LOADED, format!("unchanged: {before} monitors"));
                return Ok(()); // the pass itself did not fail
            }
        }

        // Apply: stop removed and changed monitors, insert added ones in
        // loaded-but-not-started state.
        for id in changes.removed.iter().chain(changes.changed.iter()) {
            if let Some(loaded) = monitors.remove(id) {
                loaded.monitor.stop().await;
                self.plan_loader.unload_monitor(id);
            }
        }
        for cfg in &changes.added {
            let id = cfg.monitor_id();
            match self.make_monitor(cfg.clone()).await {
                Ok(monitor) => {
                    monitors.insert(id, LoadedMonitor { monitor, started: false });
                }
                Err(e) if self.strict => return Err(e),
                Err(e) => {
                    tracing::warn!(monitor_id = %id, error = %e, "skipping monitor");
                    changes.invalid.push(format!("{id}: {e}"));
                }
            }
        }

        event::send(
            event::MONITORS_LOADED,
            format!(
                "added: {} removed: {} changed: {}",
                changes.added.len(),
                changes.removed.len(),
                changes.changed.len()
            ),
        );
        Ok(())
    }

    /// Start all loaded-but-not-started monitors, spaced by
    /// [`START_SPACING`].
    pub async fn start_monitors(&self) {
        let mut monitors = self.monitors.lock().await;
        event::send(event::MONITORS_STARTING, "");

        for (id, loaded) in monitors.iter_mut() {
            if loaded.started {
                continue;
            }
            if let Some(filter) = &self.plugins.start_monitor {
                if !filter(loaded.monitor.config()) {
                    tracing::debug!(monitor_id = %id, "monitor filtered out, not started");
                    continue;
                }
            }
            match loaded.monitor.start().await {
                Ok(()) => loaded.started = true,
                Err(e) => {
                    tracing::warn!(monitor_id = %id, error = %e, "monitor failed to start")
                }
            }
            tokio::time::sleep(START_SPACING).await;
        }

        event::send(event::MONITORS_STARTED, "");
    }

    /// Periodic reconcile, when `monitor_loader.freq` is configured. Each
    /// pass bounds source gathering at half the period; a failed pass is
    /// reported and retried on the next tick.
    pub async fn reload(&self, stop: CancellationToken) -> anyhow::Result<()> {
        if self.cfg.freq.is_empty() {
            anyhow::bail!("reload called but monitor_loader.freq is not set");
        }
        let freq = parse_duration(&self.cfg.freq).map_err(|e| anyhow::anyhow!(e))?;
        let gather_timeout = freq / 2;

        let mut ticker = tokio::time::interval(freq);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick is immediate; reload starts one period in

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            match self.load_with_timeout(Some(gather_timeout)).await {
                Ok(()) => self.start_monitors().await,
                Err(e) => {
                    event::error(
                        event::MONITORS_RELOAD_ERROR,
                        format!("error reloading monitors, will retry: {e}"),
                    );
                }
            }
        }
    }

    /// Stop every loaded monitor (agent shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.lock().await;
        for (id, loaded) in monitors.drain() {
            loaded.monitor.stop().await;
            self.plan_loader.unload_monitor(&id);
        }
    }

    pub async fn count(&self) -> usize {
        self.monitors.lock().await.len()
    }

    pub async fn monitor(&self, monitor_id: &str) -> Option<Arc<Monitor>> {
        self.monitors
            .lock()
            .await
            .get(monitor_id)
            .map(|l| l.monitor.clone())
    }

    pub async fn monitor_ids(&self) -> Vec<String> {
        self.monitors.lock().await.keys().cloned().collect()
    }

    /// Gather monitor configs from every source, finalized and keyed on
    /// monitor id.
    async fn gather(
        &self,
        changes: &mut Changes,
    ) -> anyhow::Result<HashMap<String, MonitorConfig>> {
        let mut all = HashMap::new();

        if let Some(plugin) = &self.plugins.load_monitors {
            // A user plugin is entirely responsible for loading monitors.
            let configs = plugin()?;
            self.merge(configs, &mut all, changes)?;
            return Ok(all);
        }

        self.merge(self.monitors_cfg.clone(), &mut all, changes)?;

        let from_files = self.load_files()?;
        self.merge(from_files, &mut all, changes)?;

        if let Some(cloud) = &self.cloud {
            match cloud.load().await {
                Ok(configs) => self.merge(configs, &mut all, changes)?,
                Err(e) if self.strict => return Err(e),
                Err(e) => tracing::warn!(error = %e, "cloud discovery failed, skipping"),
            }
        }

        if all.is_empty() && !self.cfg.disable_auto_local {
            let local = self.detect_local().await;
            self.merge(local, &mut all, changes)?;
        }

        Ok(all)
    }

    /// Finalize each config (defaults, env and monitor-field
    /// interpolation, monitor id, validation) and merge it into `all`.
    /// Later sources silently override earlier ones with the same id.
    fn merge(
        &self,
        configs: Vec<MonitorConfig>,
        all: &mut HashMap<String, MonitorConfig>,
        changes: &mut Changes,
    ) -> anyhow::Result<()> {
        for mut cfg in configs {
            cfg.apply_defaults(&self.defaults);
            cfg.interpolate_env();
            cfg.interpolate_monitor();
            let id = cfg.monitor_id();
            if let Err(e) = cfg.validate() {
                if self.strict {
                    anyhow::bail!(e);
                }
                tracing::warn!(monitor_id = %id, error = %e, "invalid monitor config, skipping");
                changes.invalid.push(format!("{id}: {e}"));
                continue;
            }
            all.insert(id, cfg);
        }
        Ok(())
    }

    fn load_files(&self) -> anyhow::Result<Vec<MonitorConfig>> {
        let mut configs = Vec::new();
        for file in &self.cfg.files {
            let text = match std::fs::read_to_string(file) {
                Ok(t) => t,
                Err(e) if self.strict => {
                    anyhow::bail!("cannot read monitor file {file}: {e}")
                }
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "skipping unreadable monitor file");
                    continue;
                }
            };
            let cfg: MonitorConfig = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("{file}: invalid TOML: {e}"))?;
            configs.push(cfg);
            tracing::debug!(file = %file, "monitor file loaded");
        }
        Ok(configs)
    }

    /// Try the usual local endpoints; first one that answers a ping wins.
    async fn detect_local(&self) -> Vec<MonitorConfig> {
        let mut candidates: Vec<MonitorConfig> = LOCAL_SOCKETS
            .iter()
            .map(|socket| MonitorConfig {
                id: "localhost".to_string(),
                socket: socket.to_string(),
                ..Default::default()
            })
            .collect();
        candidates.push(MonitorConfig {
            id: "localhost".to_string(),
            hostname: LOCAL_TCP.to_string(),
            ..Default::default()
        });

        for mut cfg in candidates {
            cfg.apply_defaults(&self.defaults);
            let Ok(db) = self.db_factory.make(&cfg) else {
                continue;
            };
            match tokio::time::timeout(LOCAL_DETECT_TIMEOUT, db.ping()).await {
                Ok(Ok(())) => {
                    let endpoint =
                        if cfg.socket.is_empty() { &cfg.hostname } else { &cfg.socket };
                    tracing::debug!(endpoint = %endpoint, "local instance auto-detected");
                    return vec![cfg];
                }
                _ => continue,
            }
        }
        Vec::new()
    }

    async fn make_monitor(&self, cfg: MonitorConfig) -> anyhow::Result<Arc<Monitor>> {
        self.plan_loader
            .load_monitor(&cfg, self.db_factory.as_ref())
            .await?;
        let transform: Option<TransformMetricsFn> = self.plugins.transform_metrics.clone();
        let monitor = Monitor::new(MonitorArgs {
            config: cfg,
            db_factory: self.db_factory.clone(),
            plan_loader: self.plan_loader.clone(),
            collector_factory: self.collector_factory.clone(),
            sink_factory: self.sink_factory.clone(),
            ha: self.ha.clone(),
            transform_metrics: transform,
            strict: self.strict,
            ticker_duration: self.ticker_duration,
        })?;
        Ok(Arc::new(monitor))
    }
}
