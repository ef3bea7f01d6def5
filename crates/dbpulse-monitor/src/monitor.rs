//! One running monitor: the per-instance bundle of connection, engine,
//! level collector, and the optional adjuster and heartbeat writer.

use crate::engine::Engine;
use crate::ha::HaManager;
use crate::level_adjuster::{LevelAdjuster, LevelAdjusterArgs};
use crate::level_collector::{CollectorControl, LevelCollector, LevelCollectorArgs};
use crate::TransformMetricsFn;
use dbpulse_collector::CollectorFactory;
use dbpulse_common::config::MonitorConfig;
use dbpulse_common::event::{self, MonitorEmitter};
use dbpulse_common::types::{CollectorStatus, State};
use dbpulse_db::{DbConn, DbFactory};
use dbpulse_heartbeat::Writer as HeartbeatWriter;
use dbpulse_plan::loader::PlanLoader;
use dbpulse_sink::{Sink, SinkFactory, SinkFactoryArgs};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bound on cooperative shutdown of a monitor's activities.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MonitorArgs {
    pub config: MonitorConfig,
    pub db_factory: Arc<dyn DbFactory>,
    pub plan_loader: Arc<PlanLoader>,
    pub collector_factory: Arc<dyn CollectorFactory>,
    pub sink_factory: Arc<dyn SinkFactory>,
    pub ha: Arc<dyn HaManager>,
    pub transform_metrics: Option<TransformMetricsFn>,
    pub strict: bool,
    pub ticker_duration: Duration,
}

/// A monitor exclusively owns its engine, level collector, adjuster, and
/// heartbeat writer. Built by the loader; started by `start`; torn down
/// by `stop` on unload or reconfiguration.
pub struct Monitor {
    monitor_id: String,
    config: MonitorConfig,
    db: Arc<dyn DbConn>,
    engine: Arc<Engine>,
    lpc: Arc<LevelCollector>,
    adjuster: Mutex<Option<LevelAdjuster>>,
    heartbeat: Option<Arc<HeartbeatWriter>>,
    emitter: MonitorEmitter,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: Mutex<bool>,
}

impl Monitor {
    pub fn new(args: MonitorArgs) -> anyhow::Result<Self> {
        let monitor_id = args.config.monitor_id();
        let db = args.db_factory.make(&args.config)?;

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        for (sink_name, options) in &args.config.sinks {
            let sink = args.sink_factory.make(&SinkFactoryArgs {
                sink_name: sink_name.clone(),
                monitor_id: monitor_id.clone(),
                options: options.clone(),
                tags: args.config.tags.clone(),
            })?;
            tracing::debug!(monitor_id = %monitor_id, sink = %sink_name, "sink configured");
            sinks.push(sink);
        }
        if sinks.is_empty() && !args.strict {
            // No sinks configured: print records instead of dropping them.
            let sink = args.sink_factory.make(&SinkFactoryArgs {
                sink_name: "log".to_string(),
                monitor_id: monitor_id.clone(),
                ..Default::default()
            })?;
            sinks.push(sink);
        }

        let engine = Arc::new(Engine::new(
            &monitor_id,
            db.clone(),
            args.collector_factory.clone(),
        ));

        let lpc = Arc::new(LevelCollector::new(LevelCollectorArgs {
            config: args.config.clone(),
            engine: engine.clone(),
            plan_loader: args.plan_loader.clone(),
            sinks,
            transform_metrics: args.transform_metrics.clone(),
            ticker_duration: args.ticker_duration,
        }));

        let adjuster = if args.config.plans.adjust.enabled() {
            Some(LevelAdjuster::new(LevelAdjusterArgs {
                monitor_id: monitor_id.clone(),
                config: args.config.plans.adjust.clone(),
                db: db.clone(),
                lpc: lpc.clone() as Arc<dyn CollectorControl>,
                ha: args.ha.clone(),
            }))
        } else {
            None
        };

        let heartbeat = if args.config.heartbeat.freq.is_empty() {
            None
        } else {
            Some(Arc::new(HeartbeatWriter::new(
                &monitor_id,
                db.clone(),
                &args.config.heartbeat,
            )?))
        };

        Ok(Self {
            emitter: MonitorEmitter::new(monitor_id.clone()),
            monitor_id,
            config: args.config,
            db,
            engine,
            lpc,
            adjuster: Mutex::new(adjuster),
            heartbeat,
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopped: Mutex::new(false),
        })
    }

    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn db(&self) -> Arc<dyn DbConn> {
        self.db.clone()
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    pub fn status(&self) -> CollectorStatus {
        self.lpc.status()
    }

    /// Launch the monitor's activities. With plan adjusting enabled the
    /// adjuster drives the first plan; otherwise the monitor starts in
    /// the active state on the first loaded plan.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut tasks = Vec::new();

        let adjuster = self.adjuster.lock().unwrap().take();
        match adjuster {
            Some(adjuster) => {
                let stop = self.stop.clone();
                tasks.push(tokio::spawn(adjuster.run(stop)));
            }
            None => {
                if let Err(e) = self.lpc.change_plan(State::Active, "").await {
                    tracing::warn!(monitor_id = %self.monitor_id, error = %e, "initial plan change refused");
                }
            }
        }

        if let Some(hb) = &self.heartbeat {
            let hb = hb.clone();
            let stop = self.stop.clone();
            tasks.push(tokio::spawn(async move { hb.write(stop).await }));
        }

        let lpc = self.lpc.clone();
        let stop = self.stop.clone();
        tasks.push(tokio::spawn(async move { lpc.run(stop).await }));

        self.tasks.lock().unwrap().extend(tasks);
        tracing::debug!(monitor_id = %self.monitor_id, "monitor started");
        Ok(())
    }

    /// Stop all activities cooperatively, bounded by [`STOP_TIMEOUT`].
    /// Safe to call more than once.
    pub async fn stop(&self) {
        {
            let mut stopped = self.stopped.lock().unwrap();
            if *stopped {
                return;
            }
            *stopped = true;
        }

        self.stop.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        if tokio::time::timeout(STOP_TIMEOUT, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!(monitor_id = %self.monitor_id, "monitor activities did not stop in {STOP_TIMEOUT:?}");
        }
        self.emitter.send(event::MONITOR_STOPPED, self.monitor_id.clone());
    }
}
