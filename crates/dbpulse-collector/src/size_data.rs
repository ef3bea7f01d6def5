//! `size.data`: per-database data + index size from
//! `information_schema.tables`.

use crate::{Collector, Help, HelpOption};
use anyhow::Result;
use async_trait::async_trait;
use dbpulse_common::types::{MetricType, MetricValue};
use dbpulse_db::{parse_value, DbConn};
use dbpulse_plan::Plan;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const DOMAIN: &str = "size.data";

const OPT_TOTAL: &str = "total";
const OPT_INCLUDE: &str = "include";
const OPT_EXCLUDE: &str = "exclude";
const OPT_LIKE: &str = "like";

const DEFAULT_EXCLUDE: &str = "mysql,information_schema,performance_schema,sys";

#[derive(Debug, Clone, Copy, PartialEq, Default)]
enum TotalMode {
    #[default]
    No,
    Yes,
    Only,
}

#[derive(Debug, Clone)]
struct LevelQuery {
    sql: String,
    total: TotalMode,
}

pub struct SizeData {
    db: Arc<dyn DbConn>,
    /// Keyed on level name.
    queries: Mutex<HashMap<String, LevelQuery>>,
}

impl SizeData {
    pub fn new(db: Arc<dyn DbConn>) -> Self {
        Self {
            db,
            queries: Mutex::new(HashMap::new()),
        }
    }
}

/// Build the per-level query from the domain options.
fn data_size_query(options: &std::collections::BTreeMap<String, String>) -> Result<String> {
    let like = options.get(OPT_LIKE).map(String::as_str) == Some("yes");
    let include = options.get(OPT_INCLUDE).map(String::as_str).unwrap_or("");
    let exclude = if include.is_empty() {
        options
            .get(OPT_EXCLUDE)
            .map(String::as_str)
            .unwrap_or(DEFAULT_EXCLUDE)
    } else {
        "" // include overrides exclude
    };

    let mut sql = String::from(
        "SELECT table_schema AS db, COALESCE(SUM(data_length + index_length), 0) AS bytes \
         FROM information_schema.tables",
    );

    let clause = |names: &str, negate: bool| -> Result<String> {
        let names: Vec<String> = names
            .split(',')
            .map(|n| sanitize_schema_name(n.trim()))
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            anyhow::bail!("empty database list");
        }
        if like {
            let op = if negate { "NOT LIKE" } else { "LIKE" };
            let joiner = if negate { " AND " } else { " OR " };
            Ok(names
                .iter()
                .map(|n| format!("table_schema {op} '{n}'"))
                .collect::<Vec<_>>()
                .join(joiner))
        } else {
            let op = if negate { "NOT IN" } else { "IN" };
            let list = names
                .iter()
                .map(|n| format!("'{n}'"))
                .collect::<Vec<_>>()
                .join(", ");
            Ok(format!("table_schema {op} ({list})"))
        }
    };

    if !include.is_empty() {
        sql.push_str(&format!(" WHERE {}", clause(include, false)?));
    } else if !exclude.is_empty() {
        sql.push_str(&format!(" WHERE {}", clause(exclude, true)?));
    }

    sql.push_str(" GROUP BY 1");
    Ok(sql)
}

/// Schema names are inlined into the query; keep only identifier
/// characters plus the LIKE wildcards.
fn sanitize_schema_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '$' | '_' | '%'))
        .collect()
}

#[async_trait]
impl Collector for SizeData {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn help(&self) -> Help {
        Help {
            domain: DOMAIN,
            description: "Collect database data sizes",
            options: vec![
                HelpOption {
                    name: OPT_TOTAL,
                    desc: "Report the total size of all databases (label db=\"\")",
                    default: "no",
                    values: vec![
                        ("only", "Only the total"),
                        ("yes", "Total and per-database sizes"),
                        ("no", "Only per-database sizes"),
                    ],
                },
                HelpOption {
                    name: OPT_INCLUDE,
                    desc: "Comma-separated database names to include (overrides exclude)",
                    default: "",
                    values: vec![],
                },
                HelpOption {
                    name: OPT_EXCLUDE,
                    desc: "Comma-separated database names to exclude",
                    default: DEFAULT_EXCLUDE,
                    values: vec![],
                },
                HelpOption {
                    name: OPT_LIKE,
                    desc: "Treat include/exclude entries as LIKE patterns",
                    default: "no",
                    values: vec![("yes", "LIKE patterns"), ("no", "Literal names")],
                },
            ],
        }
    }

    async fn prepare(&self, plan: &Plan) -> Result<()> {
        let mut queries = HashMap::new();
        for level in plan.levels.values() {
            let Some(dom) = level.collect.get(DOMAIN) else {
                continue;
            };
            let sql = data_size_query(&dom.options)?;
            let total = match dom.options.get(OPT_TOTAL).map(String::as_str) {
                Some("yes") => TotalMode::Yes,
                Some("only") => TotalMode::Only,
                _ => TotalMode::No,
            };
            queries.insert(level.name.clone(), LevelQuery { sql, total });
        }
        *self.queries.lock().unwrap() = queries;
        Ok(())
    }

    async fn collect(&self, level_name: &str) -> Result<Vec<MetricValue>> {
        let Some(lq) = self.queries.lock().unwrap().get(level_name).cloned() else {
            return Ok(Vec::new()); // not collected at this level
        };

        let rows = self.db.query(&lq.sql, &[]).await?;

        let mut metrics = Vec::new();
        let mut total = 0.0;
        for row in rows {
            let [db, bytes] = row.as_slice() else {
                continue;
            };
            let Some(value) = parse_value(bytes) else {
                continue;
            };
            total += value;
            if lq.total != TotalMode::Only {
                metrics.push(MetricValue {
                    name: "bytes".to_string(),
                    metric_type: MetricType::Gauge,
                    value,
                    labels: HashMap::from([("db".to_string(), db.clone())]),
                });
            }
        }

        if lq.total != TotalMode::No {
            metrics.push(MetricValue {
                name: "bytes".to_string(),
                metric_type: MetricType::Gauge,
                value: total,
                labels: HashMap::from([("db".to_string(), String::new())]),
            });
        }

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{row, MockDb};
    use std::collections::BTreeMap;

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn plan_with_options(pairs: &[(&str, &str)]) -> Plan {
        let mut plan = Plan::from_toml(
            "p",
            "[levels.l]\nfreq = \"5m\"\n[levels.l.collect.\"size.data\"]\n",
        )
        .unwrap();
        plan.levels.get_mut("l").unwrap().collect.get_mut(DOMAIN).unwrap().options =
            opts(pairs);
        plan
    }

    #[test]
    fn default_query_excludes_system_schemas() {
        let sql = data_size_query(&opts(&[])).unwrap();
        assert!(sql.contains("NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')"));
        assert!(sql.ends_with("GROUP BY 1"));
    }

    #[test]
    fn include_overrides_exclude() {
        let sql =
            data_size_query(&opts(&[("include", "app,orders"), ("exclude", "ignored")])).unwrap();
        assert!(sql.contains("table_schema IN ('app', 'orders')"));
        assert!(!sql.contains("NOT IN"));
    }

    #[test]
    fn like_patterns_expand_to_like_clauses() {
        let sql = data_size_query(&opts(&[("include", "shard_%"), ("like", "yes")])).unwrap();
        assert!(sql.contains("table_schema LIKE 'shard_%'"));
    }

    #[test]
    fn schema_names_are_sanitized() {
        let sql = data_size_query(&opts(&[("include", "app'; DROP TABLE x--")])).unwrap();
        assert!(sql.contains("IN ('appDROPTABLEx')"));
    }

    #[tokio::test]
    async fn total_yes_appends_summed_row() {
        let mc = SizeData::new(Arc::new(MockDb::with_rows(vec![
            row(&["app", "1000"]),
            row(&["orders", "500"]),
        ])));
        mc.prepare(&plan_with_options(&[("total", "yes")])).await.unwrap();

        let vals = mc.collect("l").await.unwrap();
        assert_eq!(vals.len(), 3);
        let total = vals.iter().find(|v| v.labels["db"].is_empty()).unwrap();
        assert_eq!(total.value, 1500.0);
    }

    #[tokio::test]
    async fn total_only_reports_a_single_row() {
        let mc = SizeData::new(Arc::new(MockDb::with_rows(vec![
            row(&["app", "1000"]),
            row(&["orders", "500"]),
        ])));
        mc.prepare(&plan_with_options(&[("total", "only")])).await.unwrap();

        let vals = mc.collect("l").await.unwrap();
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0].value, 1500.0);
        assert_eq!(vals[0].labels["db"], "");
    }

    #[tokio::test]
    async fn unconfigured_level_is_empty() {
        let mc = SizeData::new(Arc::new(MockDb::default()));
        mc.prepare(&plan_with_options(&[])).await.unwrap();
        assert!(mc.collect("other").await.unwrap().is_empty());
    }
}
