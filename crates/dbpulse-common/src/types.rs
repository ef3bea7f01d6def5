use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whether a metric value is a point-in-time reading or a monotonic total.
///
/// The type of a given metric must not change across agent restarts;
/// downstream systems key rate computations on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Gauge,
    Counter,
}

/// One collected metric value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Metrics collected for one plan level, from one database instance.
///
/// Produced by one collection pass; once handed to a sink the sink must not
/// mutate it and collectors must not retain references into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub monitor_id: String,
    pub plan: String,
    pub level: String,
    pub state: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Keyed on domain; each entry is that domain's values for this pass.
    pub values: HashMap<String, Vec<MetricValue>>,
}

/// Database instance state as observed by the plan adjuster.
///
/// "none" (no state yet) is represented as `Option::<State>::None`, never as
/// a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    Offline,
    Standby,
    ReadOnly,
    Active,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Offline => "offline",
            State::Standby => "standby",
            State::ReadOnly => "read-only",
            State::Active => "active",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(State::Offline),
            "standby" => Ok(State::Standby),
            "read-only" => Ok(State::ReadOnly),
            "active" => Ok(State::Active),
            _ => Err(format!("unknown state: {s}")),
        }
    }
}

/// Snapshot of a level collector's internal status.
///
/// Returned by value; holds no references into the collector.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectorStatus {
    pub state: Option<State>,
    pub plan: String,
    pub paused: bool,
    pub last_collect_ts: Option<DateTime<Utc>>,
    pub last_collect_error: Option<String>,
    pub last_collect_error_ts: Option<DateTime<Utc>>,
    /// Keyed on sink name; present only for sinks whose last send failed.
    pub sink_errors: HashMap<String, String>,
}
