//! `status.global`: global status counters from `SHOW GLOBAL STATUS`.

use crate::{Collector, Help, HelpOption};
use anyhow::Result;
use async_trait::async_trait;
use dbpulse_common::types::{MetricType, MetricValue};
use dbpulse_db::{parse_value, DbConn};
use dbpulse_plan::Plan;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const DOMAIN: &str = "status.global";

const OPT_ALL: &str = "all";

const QUERY: &str = "SHOW GLOBAL STATUS";

/// Status variables that are point-in-time readings, not counters.
const GAUGES: &[&str] = &[
    "threads_running",
    "threads_connected",
    "prepared_stmt_count",
    "innodb_buffer_pool_pages_dirty",
    "innodb_buffer_pool_pages_free",
    "innodb_buffer_pool_pages_total",
    "innodb_row_lock_current_waits",
    "innodb_os_log_pending_writes",
];

#[derive(Default)]
struct Prepared {
    /// Levels collecting every status variable.
    all: HashSet<String>,
    /// Levels collecting an explicit set, keyed on level name.
    keep: HashMap<String, HashSet<String>>,
}

pub struct StatusGlobal {
    db: Arc<dyn DbConn>,
    prepared: Mutex<Prepared>,
}

impl StatusGlobal {
    pub fn new(db: Arc<dyn DbConn>) -> Self {
        Self {
            db,
            prepared: Mutex::new(Prepared::default()),
        }
    }
}

#[async_trait]
impl Collector for StatusGlobal {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn help(&self) -> Help {
        Help {
            domain: DOMAIN,
            description: "Collect global status variables",
            options: vec![HelpOption {
                name: OPT_ALL,
                desc: "Collect all status variables",
                default: "no",
                values: vec![
                    ("yes", "All variables"),
                    ("no", "Only the level's metric list"),
                ],
            }],
        }
    }

    async fn prepare(&self, plan: &Plan) -> Result<()> {
        let mut prepared = Prepared::default();
        for level in plan.levels.values() {
            let Some(dom) = level.collect.get(DOMAIN) else {
                continue;
            };
            if dom.options.get(OPT_ALL).map(String::as_str) == Some("yes") {
                prepared.all.insert(level.name.clone());
            } else {
                prepared.keep.insert(
                    level.name.clone(),
                    dom.metrics.iter().map(|m| m.to_lowercase()).collect(),
                );
            }
        }
        *self.prepared.lock().unwrap() = prepared;
        Ok(())
    }

    async fn collect(&self, level_name: &str) -> Result<Vec<MetricValue>> {
        let (configured, filter, keep) = {
            let prepared = self.prepared.lock().unwrap();
            let all = prepared.all.contains(level_name);
            let keep = prepared.keep.get(level_name).cloned();
            (all || keep.is_some(), !all, keep.unwrap_or_default())
        };
        if !configured {
            return Ok(Vec::new());
        }

        let rows = self.db.query(QUERY, &[]).await?;
        let mut metrics = Vec::new();
        for row in rows {
            let [name, value] = row.as_slice() else {
                continue;
            };
            let name = name.to_lowercase();
            if filter && !keep.contains(&name) {
                continue;
            }
            let Some(value) = parse_value(value) else {
                continue; // non-numeric status variable
            };
            let metric_type = if GAUGES.contains(&name.as_str()) {
                MetricType::Gauge
            } else {
                MetricType::Counter
            };
            metrics.push(MetricValue {
                name,
                metric_type,
                value,
                labels: HashMap::new(),
            });
        }
        Ok(metrics)
    }
}
