//! Shared mocks for control-plane tests: database, collectors, sinks.

#![allow(dead_code)] // not every test file uses every helper

use async_trait::async_trait;
use dbpulse_collector::{Collector, CollectorFactory, FactoryArgs, Help};
use dbpulse_common::config::MonitorConfig;
use dbpulse_common::types::{MetricRecord, MetricType, MetricValue};
use dbpulse_db::{DbConn, DbError, DbFactory, Param, Row};
use dbpulse_plan::loader::{PlanLoader, PlanPluginFn, PlanSourcesConfig};
use dbpulse_plan::Plan;
use dbpulse_sink::Sink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Database

#[derive(Default)]
pub struct MockDb {
    pub ping_fail: AtomicBool,
    pub rows: Mutex<Vec<Row>>,
    pub pings: AtomicUsize,
}

impl MockDb {
    pub fn set_rows(&self, rows: Vec<Row>) {
        *self.rows.lock().unwrap() = rows;
    }
}

#[async_trait]
impl DbConn for MockDb {
    async fn ping(&self) -> Result<(), DbError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.ping_fail.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("ping refused".into()));
        }
        Ok(())
    }

    async fn query(&self, _sql: &str, _params: &[Param]) -> Result<Vec<Row>, DbError> {
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn exec(&self, _sql: &str, _params: &[Param]) -> Result<u64, DbError> {
        Ok(1)
    }
}

pub struct MockDbFactory {
    pub db: Arc<MockDb>,
}

impl MockDbFactory {
    pub fn new() -> Self {
        Self { db: Arc::new(MockDb::default()) }
    }
}

impl DbFactory for MockDbFactory {
    fn make(&self, _cfg: &MonitorConfig) -> Result<Arc<dyn DbConn>, DbError> {
        Ok(self.db.clone())
    }
}

// ---------------------------------------------------------------------------
// Collectors

#[derive(Default)]
pub struct CollectorStats {
    pub prepare_calls: AtomicUsize,
    pub collect_calls: AtomicUsize,
    pub levels: Mutex<Vec<String>>,
    running: AtomicIsize,
    pub max_running: AtomicIsize,
}

impl CollectorStats {
    pub fn collects(&self) -> usize {
        self.collect_calls.load(Ordering::SeqCst)
    }
}

struct MockCollector {
    domain: &'static str,
    stats: Arc<CollectorStats>,
    prepare_delay: Duration,
    collect_delay: Duration,
}

#[async_trait]
impl Collector for MockCollector {
    fn domain(&self) -> &'static str {
        self.domain
    }

    fn help(&self) -> Help {
        Help { domain: self.domain, description: "test collector", options: vec![] }
    }

    async fn prepare(&self, _plan: &Plan) -> anyhow::Result<()> {
        self.stats.prepare_calls.fetch_add(1, Ordering::SeqCst);
        if !self.prepare_delay.is_zero() {
            tokio::time::sleep(self.prepare_delay).await;
        }
        Ok(())
    }

    async fn collect(&self, level_name: &str) -> anyhow::Result<Vec<MetricValue>> {
        let running = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_running.fetch_max(running, Ordering::SeqCst);
        if !self.collect_delay.is_zero() {
            tokio::time::sleep(self.collect_delay).await;
        }
        self.stats.levels.lock().unwrap().push(level_name.to_string());
        self.stats.collect_calls.fetch_add(1, Ordering::SeqCst);
        self.stats.running.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![MetricValue {
            name: "test".to_string(),
            metric_type: MetricType::Gauge,
            value: 1.0,
            labels: HashMap::new(),
        }])
    }
}

/// Builds a `MockCollector` for any domain; per-domain stats and delays.
#[derive(Default)]
pub struct MockCollectorFactory {
    delays: Mutex<HashMap<String, (Duration, Duration)>>,
    stats: Mutex<HashMap<String, Arc<CollectorStats>>>,
}

impl MockCollectorFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Per-domain (prepare, collect) delays.
    pub fn set_delays(&self, domain: &str, prepare: Duration, collect: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(domain.to_string(), (prepare, collect));
    }

    pub fn stats(&self, domain: &str) -> Arc<CollectorStats> {
        self.stats
            .lock()
            .unwrap()
            .entry(domain.to_string())
            .or_default()
            .clone()
    }
}

impl CollectorFactory for MockCollectorFactory {
    fn make(&self, domain: &str, _args: &FactoryArgs) -> anyhow::Result<Arc<dyn Collector>> {
        let (prepare_delay, collect_delay) = self
            .delays
            .lock()
            .unwrap()
            .get(domain)
            .copied()
            .unwrap_or((Duration::ZERO, Duration::ZERO));
        Ok(Arc::new(MockCollector {
            domain: Box::leak(domain.to_string().into_boxed_str()),
            stats: self.stats(domain),
            prepare_delay,
            collect_delay,
        }))
    }
}

// ---------------------------------------------------------------------------
// Sinks

pub struct MockSink {
    name: String,
    monitor_id: String,
    pub fail: AtomicBool,
    pub records: Mutex<Vec<MetricRecord>>,
}

impl MockSink {
    pub fn new(name: &str, monitor_id: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            monitor_id: monitor_id.to_string(),
            fail: AtomicBool::new(false),
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn sends(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl Sink for MockSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, metrics: &MetricRecord) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("sink backend unreachable");
        }
        self.records.lock().unwrap().push(metrics.clone());
        Ok(())
    }

    fn monitor_id(&self) -> &str {
        &self.monitor_id
    }
}

// ---------------------------------------------------------------------------
// Plans and helpers

/// A plan loader whose shared plans come from the given list.
pub async fn plan_loader_with(plans: Vec<Plan>) -> Arc<PlanLoader> {
    let plugin: PlanPluginFn = Arc::new(move |_cfg| Ok(plans.clone()));
    let loader = Arc::new(PlanLoader::new(Some(plugin), false));
    let factory = MockDbFactory::new();
    loader
        .load_shared(&PlanSourcesConfig::default(), &factory)
        .await
        .expect("shared plans load");
    loader
}

pub fn monitor_config(id: &str) -> MonitorConfig {
    MonitorConfig {
        id: id.to_string(),
        hostname: format!("{id}.test:3306"),
        username: "dbpulse".to_string(),
        ..Default::default()
    }
}

/// Poll until `cond` holds or `timeout` elapses; panics on timeout.
pub async fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
