//! Boot sequence: wire the factories, load plans and monitors, run until
//! shutdown.

use crate::config::AgentConfig;
use async_trait::async_trait;
use dbpulse_common::config::MonitorConfig;
use dbpulse_db::{DbConn, DbError, DbFactory, Param, Row};
use dbpulse_monitor::loader::{MonitorLoader, MonitorLoaderArgs};
use dbpulse_monitor::{ha, Plugins};
use dbpulse_plan::loader::PlanLoader;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// This build carries no concrete database driver; embedders supply a
/// real [`DbFactory`] when assembling the loader themselves. Connections
/// from this factory behave like an unreachable instance, so the control
/// plane still runs: engines retry, adjusters observe offline, heartbeat
/// writers back off.
struct NullDbFactory;

struct UnreachableDb;

#[async_trait]
impl DbConn for UnreachableDb {
    async fn ping(&self) -> Result<(), DbError> {
        Err(DbError::Unavailable("no database driver built in".into()))
    }
    async fn query(&self, _sql: &str, _params: &[Param]) -> Result<Vec<Row>, DbError> {
        Err(DbError::Unavailable("no database driver built in".into()))
    }
    async fn exec(&self, _sql: &str, _params: &[Param]) -> Result<u64, DbError> {
        Err(DbError::Unavailable("no database driver built in".into()))
    }
}

impl DbFactory for NullDbFactory {
    fn make(&self, _cfg: &MonitorConfig) -> Result<Arc<dyn DbConn>, DbError> {
        Ok(Arc::new(UnreachableDb))
    }
}

pub async fn run(cfg: AgentConfig) -> anyhow::Result<()> {
    let db_factory: Arc<dyn DbFactory> = Arc::new(NullDbFactory);

    let plan_loader = Arc::new(PlanLoader::new(None, cfg.strict));
    plan_loader
        .load_shared(&cfg.plans, db_factory.as_ref())
        .await?;

    let loader = Arc::new(MonitorLoader::new(MonitorLoaderArgs {
        monitors: cfg.monitors,
        loader_config: cfg.monitor_loader.clone(),
        defaults: cfg.defaults,
        strict: cfg.strict,
        db_factory,
        plan_loader,
        collector_factory: Arc::new(dbpulse_collector::Registry::with_defaults()),
        sink_factory: Arc::new(dbpulse_sink::Registry::with_defaults()),
        ha: ha::disabled(),
        plugins: Plugins::default(),
        cloud: None,
        ticker_duration: Duration::from_secs(1),
    })?);

    loader.load().await?;
    loader.start_monitors().await;
    tracing::info!(monitors = loader.count().await, "dbpulse-agent running");

    let stop = CancellationToken::new();
    let reload_task = if cfg.monitor_loader.freq.is_empty() {
        None
    } else {
        let loader = loader.clone();
        let stop = stop.clone();
        Some(tokio::spawn(async move { loader.reload(stop).await }))
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    stop.cancel();
    if let Some(task) = reload_task {
        let _ = task.await;
    }
    loader.stop_all().await;
    Ok(())
}
