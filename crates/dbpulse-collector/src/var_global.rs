//! `var.global`: global system variables from `SHOW GLOBAL VARIABLES`.
//!
//! Same shape as `status.global`, but system variables are settings, so
//! every value reports as a gauge.

use crate::{Collector, Help, HelpOption};
use anyhow::Result;
use async_trait::async_trait;
use dbpulse_common::types::{MetricType, MetricValue};
use dbpulse_db::{parse_value, DbConn};
use dbpulse_plan::Plan;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const DOMAIN: &str = "var.global";

const OPT_ALL: &str = "all";

const QUERY: &str = "SHOW GLOBAL VARIABLES";

#[derive(Default)]
struct Prepared {
    all: HashSet<String>,
    keep: HashMap<String, HashSet<String>>,
}

pub struct VarGlobal {
    db: Arc<dyn DbConn>,
    prepared: Mutex<Prepared>,
}

impl VarGlobal {
    pub fn new(db: Arc<dyn DbConn>) -> Self {
        Self {
            db,
            prepared: Mutex::new(Prepared::default()),
        }
    }
}

#[async_trait]
impl Collector for VarGlobal {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn help(&self) -> Help {
        Help {
            domain: DOMAIN,
            description: "Collect global system variables",
            options: vec![HelpOption {
                name: OPT_ALL,
                desc: "Collect all system variables",
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
                continue;
            };
            metrics.push(MetricValue {
                name,
                metric_type: MetricType::Gauge,
                value,
                labels: HashMap::new(),
            });
        }
        Ok(metrics)
    }
}
