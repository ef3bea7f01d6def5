//! Metric sinks: where collected records go.
//!
//! A sink forwards one [`MetricRecord`] to an external system. Transport
//! sinks live outside this workspace; the built-in `log` sink writes each
//! record as a JSON line and is the fallback when a monitor configures no
//! sinks. Sinks are built through a [`SinkFactory`]; the [`Registry`] is
//! the explicit factory value and [`registry()`] the process-wide
//! convenience.

pub mod log;

use anyhow::Result;
use async_trait::async_trait;
use dbpulse_common::event;
use dbpulse_common::types::MetricRecord;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

/// Forwards metric records to one destination.
///
/// Send failures must stay inside the sink's own reporting: a failing
/// sink never cancels other sinks or the collection that produced the
/// record. Sinks must not mutate or retain the record.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, metrics: &MetricRecord) -> Result<()>;

    fn monitor_id(&self) -> &str;
}

/// Construction arguments passed to sink factories.
#[derive(Clone, Default)]
pub struct SinkFactoryArgs {
    pub sink_name: String,
    pub monitor_id: String,
    pub options: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

pub trait SinkFactory: Send + Sync {
    fn make(&self, args: &SinkFactoryArgs) -> Result<Arc<dyn Sink>>;
}

/// Factory for the built-in `log` sink.
pub struct DefaultFactory;

impl SinkFactory for DefaultFactory {
    fn make(&self, args: &SinkFactoryArgs) -> Result<Arc<dyn Sink>> {
        match args.sink_name.as_str() {
            "log" => Ok(Arc::new(log::LogSink::new(&args.monitor_id))),
            other => anyhow::bail!("sink {other} not registered"),
        }
    }
}

/// A sink-name → factory map, mirroring the collector registry.
pub struct Registry {
    factories: Mutex<HashMap<String, Arc<dyn SinkFactory>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        let r = Self::new();
        r.register("log", Arc::new(DefaultFactory))
            .expect("built-ins register once");
        r
    }

    pub fn register(&self, sink_name: &str, factory: Arc<dyn SinkFactory>) -> Result<()> {
        let mut factories = self.factories.lock().unwrap();
        if factories.contains_key(sink_name) {
            anyhow::bail!("{sink_name} already registered");
        }
        factories.insert(sink_name.to_string(), factory);
        event::send(event::REGISTER_SINKS, sink_name.to_string());
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkFactory for Registry {
    fn make(&self, args: &SinkFactoryArgs) -> Result<Arc<dyn Sink>> {
        let factory = {
            let factories = self.factories.lock().unwrap();
            factories
                .get(&args.sink_name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("sink {} not registered", args.sink_name))?
        };
        factory.make(args)
    }
}

/// The process-wide sink registry, created with the built-ins on first
/// use.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::with_defaults)
}
