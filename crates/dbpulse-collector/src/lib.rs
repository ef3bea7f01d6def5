//! Metric collectors: one per domain.
//!
//! A collector turns a prepared plan plus a level name into a slice of
//! metric values. The engine owns collector instances (one per domain,
//! reused across plan swaps) and builds them through a
//! [`CollectorFactory`]. The [`Registry`] is an explicit factory value;
//! the process-wide [`registry()`] is a convenience wrapper around one.

pub mod size_data;
pub mod status_global;
pub mod var_global;

#[cfg(test)]
pub(crate) mod testutil;

use anyhow::Result;
use async_trait::async_trait;
use dbpulse_common::event;
use dbpulse_common::types::MetricValue;
use dbpulse_db::DbConn;
use dbpulse_plan::Plan;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Documentation and option schema for one collector.
#[derive(Debug, Clone)]
pub struct Help {
    pub domain: &'static str,
    pub description: &'static str,
    pub options: Vec<HelpOption>,
}

#[derive(Debug, Clone)]
pub struct HelpOption {
    pub name: &'static str,
    pub desc: &'static str,
    pub default: &'static str,
    /// (value, meaning) pairs; empty for free-form options.
    pub values: Vec<(&'static str, &'static str)>,
}

/// Collects metrics for a single domain.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable domain identifier, e.g. `"status.global"`.
    fn domain(&self) -> &'static str;

    /// Usage documentation and the option schema.
    fn help(&self) -> Help;

    /// Pre-compile per-level work for the plan. Returns an error when the
    /// plan is invalid for this collector.
    async fn prepare(&self, plan: &Plan) -> Result<()>;

    /// Collect values for one level. Returns an empty slice when the
    /// domain is not configured at this level.
    async fn collect(&self, level_name: &str) -> Result<Vec<MetricValue>>;
}

/// Construction arguments passed to factories.
#[derive(Clone)]
pub struct FactoryArgs {
    pub monitor_id: String,
    pub db: Arc<dyn DbConn>,
}

/// Builds collectors by domain.
pub trait CollectorFactory: Send + Sync {
    fn make(&self, domain: &str, args: &FactoryArgs) -> Result<Arc<dyn Collector>>;
}

/// Factory for the built-in domains.
pub struct DefaultFactory;

pub const BUILTIN_DOMAINS: &[&str] = &["status.global", "var.global", "size.data"];

impl CollectorFactory for DefaultFactory {
    fn make(&self, domain: &str, args: &FactoryArgs) -> Result<Arc<dyn Collector>> {
        match domain {
            "status.global" => Ok(Arc::new(status_global::StatusGlobal::new(args.db.clone()))),
            "var.global" => Ok(Arc::new(var_global::VarGlobal::new(args.db.clone()))),
            "size.data" => Ok(Arc::new(size_data::SizeData::new(args.db.clone()))),
            _ => anyhow::bail!("collector for domain {domain} not registered"),
        }
    }
}

/// A domain → factory map. Pass one into `Monitor`/`Engine` construction;
/// the global [`registry()`] exists only for embedders that prefer
/// process-wide registration.
pub struct Registry {
    factories: Mutex<HashMap<String, Arc<dyn CollectorFactory>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with the built-in domains.
    pub fn with_defaults() -> Self {
        let r = Self::new();
        let f: Arc<dyn CollectorFactory> = Arc::new(DefaultFactory);
        for domain in BUILTIN_DOMAINS {
            r.register(domain, f.clone()).expect("built-ins register once");
        }
        r
    }

    pub fn register(&self, domain: &str, factory: Arc<dyn CollectorFactory>) -> Result<()> {
        let mut factories = self.factories.lock().unwrap();
        if factories.contains_key(domain) {
            anyhow::bail!("{domain} already registered");
        }
        factories.insert(domain.to_string(), factory);
        event::send(event::REGISTER_METRICS, domain.to_string());
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorFactory for Registry {
    fn make(&self, domain: &str, args: &FactoryArgs) -> Result<Arc<dyn Collector>> {
        let factory = {
            let factories = self.factories.lock().unwrap();
            factories
                .get(domain)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("collector for domain {domain} not registered"))?
        };
        factory.make(domain, args)
    }
}

/// The process-wide registry, created with the built-in domains on first
/// use.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::with_defaults)
}
