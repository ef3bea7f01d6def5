//! The per-monitor control plane.
//!
//! Each monitored instance gets one [`monitor::Monitor`], which owns a
//! [`level_collector::LevelCollector`] (drives collection on whole-second
//! ticks), an [`engine::Engine`] (prepares and executes collectors), an
//! optional [`level_adjuster::LevelAdjuster`] (swaps plans on debounced
//! instance-state changes), and an optional heartbeat writer. The
//! [`loader::MonitorLoader`] reconciles the set of running monitors
//! against the configured sources.

pub mod engine;
pub mod ha;
pub mod level_adjuster;
pub mod level_collector;
pub mod loader;
pub mod monitor;

use dbpulse_common::config::MonitorConfig;
use dbpulse_common::types::MetricRecord;
use std::sync::Arc;

/// User hook run on every collected record before it reaches the sinks.
pub type TransformMetricsFn = Arc<dyn Fn(&mut MetricRecord) + Send + Sync>;

/// User hook that replaces the built-in monitor sources entirely.
pub type LoadMonitorsFn =
    Arc<dyn Fn() -> anyhow::Result<Vec<MonitorConfig>> + Send + Sync>;

/// User hook that filters which loaded monitors actually start.
pub type StartMonitorFn = Arc<dyn Fn(&MonitorConfig) -> bool + Send + Sync>;

/// Optional user hooks, injected at loader construction.
#[derive(Clone, Default)]
pub struct Plugins {
    pub load_monitors: Option<LoadMonitorsFn>,
    pub start_monitor: Option<StartMonitorFn>,
    pub transform_metrics: Option<TransformMetricsFn>,
}
