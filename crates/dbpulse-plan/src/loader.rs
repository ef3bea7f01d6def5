//! The plan loader: a repository of shared and per-monitor plans.
//!
//! Shared plans come from the agent config (`plans.files`, `plans.table`,
//! or a plugin); per-monitor plans from `monitors.*.plans`. When nothing
//! is configured and the agent is not strict, a built-in default plan is
//! installed so a bare config still collects something useful.

use crate::{Plan, PlanError};
use dbpulse_common::config::MonitorConfig;
use dbpulse_db::{sanitize_table, DbConn, DbFactory, Param};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Shared plan sources from the agent config.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PlanSourcesConfig {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub table: String,
    /// Connection config for `table`; reuses the monitor shape for its
    /// DSN fields only.
    #[serde(default)]
    pub monitor: Option<MonitorConfig>,
}

/// User-supplied plan source; when set it replaces the built-in sources.
pub type PlanPluginFn =
    Arc<dyn Fn(&PlanSourcesConfig) -> Result<Vec<Plan>, PlanError> + Send + Sync>;

/// Name + source of one loaded plan, for the status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanLoaded {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone)]
struct PlanMeta {
    name: String,
    source: String,
    /// Resolve against the shared list instead of carrying a plan copy.
    /// An empty name means "first shared plan".
    shared_ref: bool,
    plan: Plan,
}

pub const DEFAULT_PLAN_NAME: &str = "default";

const DEFAULT_PLAN_TOML: &str = r#"
[levels.performance]
freq = "1s"

[levels.performance.collect."status.global"]
metrics = [
    "threads_running",
    "threads_connected",
    "queries",
    "slow_queries",
    "innodb_row_lock_current_waits",
]

[levels.sysvars]
freq = "30s"

[levels.sysvars.collect."var.global"]
metrics = ["max_connections", "innodb_buffer_pool_size"]

[levels.data-size]
freq = "5m"

[levels.data-size.collect."size.data"]
options = { total = "yes" }
"#;

/// The built-in plan used when no plan source is configured.
pub fn default_plan() -> Plan {
    Plan::from_toml(DEFAULT_PLAN_NAME, DEFAULT_PLAN_TOML).expect("built-in plan decodes")
}

const TABLE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Singleton repository of level plans.
///
/// `load_shared` runs at boot (and on reload); `load_monitor` runs when a
/// monitor is built; `plan` is called from the LPC's plan-swap path.
pub struct PlanLoader {
    plugin: Option<PlanPluginFn>,
    strict: bool,
    shared: RwLock<Vec<PlanMeta>>,
    monitor: RwLock<HashMap<String, Vec<PlanMeta>>>,
}

impl PlanLoader {
    pub fn new(plugin: Option<PlanPluginFn>, strict: bool) -> Self {
        Self {
            plugin,
            strict,
            shared: RwLock::new(Vec::new()),
            monitor: RwLock::new(HashMap::new()),
        }
    }

    /// Load all shared plans. Replaces the previous shared set on success.
    pub async fn load_shared(
        &self,
        cfg: &PlanSourcesConfig,
        db_factory: &dyn DbFactory,
    ) -> Result<(), PlanError> {
        if let Some(plugin) = &self.plugin {
            let plans = plugin(cfg)?;
            let mut metas = Vec::with_capacity(plans.len());
            for plan in plans {
                plan.validate()?;
                metas.push(PlanMeta {
                    name: plan.name.clone(),
                    source: "plugin".to_string(),
                    shared_ref: false,
                    plan,
                });
            }
            *self.shared.write().unwrap() = metas;
            return Ok(());
        }

        let mut metas = Vec::new();

        if !cfg.table.is_empty() {
            let moncfg = cfg.monitor.as_ref().ok_or_else(|| PlanError::Invalid {
                name: cfg.table.clone(),
                message: "plans.table set but plans.monitor is not".to_string(),
            })?;
            let db = db_factory.make(moncfg)?;
            for plan in read_plan_table(&cfg.table, db.as_ref(), "").await? {
                plan.validate()?;
                metas.push(PlanMeta {
                    name: plan.name.clone(),
                    source: cfg.table.clone(),
                    shared_ref: false,
                    plan,
                });
            }
        }

        metas.extend(self.read_plan_files(&cfg.files, &[])?);

        if metas.is_empty() && !self.strict {
            let plan = default_plan();
            tracing::debug!("no plan sources configured, using built-in plan");
            metas.push(PlanMeta {
                name: plan.name.clone(),
                source: "built-in".to_string(),
                shared_ref: false,
                plan,
            });
        }

        *self.shared.write().unwrap() = metas;
        Ok(())
    }

    /// Load one monitor's plans: `monitors.*.plans.table` and `.files`,
    /// falling back to a reference to the first shared plan.
    pub async fn load_monitor(
        &self,
        mon: &MonitorConfig,
        db_factory: &dyn DbFactory,
    ) -> Result<(), PlanError> {
        let monitor_id = mon.monitor_id();
        let mut metas = Vec::new();

        if !mon.plans.table.is_empty() {
            let db = db_factory.make(mon)?;
            for plan in read_plan_table(&mon.plans.table, db.as_ref(), &monitor_id).await? {
                plan.validate()?;
                metas.push(PlanMeta {
                    name: plan.name.clone(),
                    source: mon.plans.table.clone(),
                    shared_ref: false,
                    plan,
                });
            }
        }

        let shared_names: Vec<String> = {
            let shared = self.shared.read().unwrap();
            shared.iter().map(|m| m.name.clone()).collect()
        };
        metas.extend(self.read_plan_files(&mon.plans.files, &shared_names)?);

        if metas.is_empty() && !self.strict {
            metas.push(PlanMeta {
                name: String::new(), // first shared plan
                source: "shared".to_string(),
                shared_ref: true,
                plan: Plan::default(),
            });
        }

        tracing::debug!(monitor_id = %monitor_id, plans = metas.len(), "monitor plans loaded");
        self.monitor.write().unwrap().insert(monitor_id, metas);
        Ok(())
    }

    /// Forget a monitor's plans (called when the monitor is unloaded).
    pub fn unload_monitor(&self, monitor_id: &str) {
        self.monitor.write().unwrap().remove(monitor_id);
    }

    /// Resolve a plan for a monitor. An empty `plan_name` selects the
    /// first plan by precedence: monitor plans, then shared plans. A named
    /// plan is searched in the monitor's list first, then the shared list.
    pub fn plan(&self, monitor_id: &str, plan_name: &str) -> Result<Plan, PlanError> {
        let monitors = self.monitor.read().unwrap();
        let metas = monitors.get(monitor_id).ok_or_else(|| PlanError::NoPlans {
            monitor_id: monitor_id.to_string(),
        })?;
        if metas.is_empty() {
            return Err(PlanError::NoPlans {
                monitor_id: monitor_id.to_string(),
            });
        }

        if plan_name.is_empty() {
            return self.resolve(monitor_id, &metas[0]);
        }

        if let Some(meta) = metas.iter().find(|m| m.name == plan_name) {
            return self.resolve(monitor_id, meta);
        }

        let shared = self.shared.read().unwrap();
        shared
            .iter()
            .find(|m| m.name == plan_name)
            .map(|m| m.plan.clone())
            .ok_or_else(|| PlanError::NotFound {
                monitor_id: monitor_id.to_string(),
                plan: plan_name.to_string(),
            })
    }

    fn resolve(&self, monitor_id: &str, meta: &PlanMeta) -> Result<Plan, PlanError> {
        if !meta.shared_ref {
            return Ok(meta.plan.clone());
        }
        let shared = self.shared.read().unwrap();
        let found = if meta.name.is_empty() {
            shared.first()
        } else {
            shared.iter().find(|m| m.name == meta.name)
        };
        found
            .map(|m| m.plan.clone())
            .ok_or_else(|| PlanError::SharedNotFound {
                monitor_id: monitor_id.to_string(),
                plan: meta.name.clone(),
            })
    }

    /// Names and sources of loaded plans: the shared set for an empty
    /// `monitor_id`, else that monitor's own list.
    pub fn plans_loaded(&self, monitor_id: &str) -> Vec<PlanLoaded> {
        if monitor_id.is_empty() {
            let shared = self.shared.read().unwrap();
            return shared
                .iter()
                .map(|m| PlanLoaded {
                    name: m.name.clone(),
                    source: m.source.clone(),
                })
                .collect();
        }
        let monitors = self.monitor.read().unwrap();
        monitors
            .get(monitor_id)
            .map(|metas| {
                metas
                    .iter()
                    .map(|m| PlanLoaded {
                        name: m.name.clone(),
                        source: m.source.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn read_plan_files(
        &self,
        files: &[String],
        shared_names: &[String],
    ) -> Result<Vec<PlanMeta>, PlanError> {
        let mut metas = Vec::new();
        for file in files {
            if shared_names.iter().any(|n| n == file) {
                // Already loaded as a shared plan; reference it.
                metas.push(PlanMeta {
                    name: file.clone(),
                    source: "shared".to_string(),
                    shared_ref: true,
                    plan: Plan::default(),
                });
                continue;
            }
            let plan = match Plan::from_file(file) {
                Ok(p) => p,
                Err(e) if self.strict => return Err(e),
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "skipping unreadable plan file");
                    continue;
                }
            };
            plan.validate()?;
            metas.push(PlanMeta {
                name: file.clone(),
                source: file.clone(),
                shared_ref: false,
                plan,
            });
        }
        Ok(metas)
    }
}

/// Read plans from a database table with columns
/// `(name, plan, monitor_id)`; `plan` holds the levels as TOML text. An
/// empty `monitor_id` reads all rows.
pub async fn read_plan_table(
    table: &str,
    db: &dyn DbConn,
    monitor_id: &str,
) -> Result<Vec<Plan>, PlanError> {
    let table = sanitize_table(table, "dbpulse");
    let (sql, params): (String, Vec<Param>) = if monitor_id.is_empty() {
        (
            format!("SELECT name, plan, COALESCE(monitor_id, '') FROM {table} ORDER BY name ASC"),
            vec![],
        )
    } else {
        (
            format!(
                "SELECT name, plan, COALESCE(monitor_id, '') FROM {table} \
                 WHERE monitor_id = ? ORDER BY name ASC"
            ),
            vec![Param::from(monitor_id)],
        )
    };

    let rows = tokio::time::timeout(TABLE_READ_TIMEOUT, db.query(&sql, &params))
        .await
        .map_err(|_| {
            PlanError::Db(dbpulse_db::DbError::Unavailable(format!(
                "plan table read timed out after {TABLE_READ_TIMEOUT:?}"
            )))
        })??;

    let mut plans = Vec::with_capacity(rows.len());
    for row in rows {
        let (name, levels, row_monitor_id) = match row.as_slice() {
            [n, l, m] => (n.clone(), l.clone(), m.clone()),
            _ => {
                return Err(PlanError::Parse {
                    name: table.clone(),
                    message: format!("expected 3 columns, got {}", row.len()),
                })
            }
        };
        let mut plan = Plan::from_toml(&name, &levels)?;
        plan.monitor_id = row_monitor_id;
        plans.push(plan);
    }
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock::MockDb;
    use std::path::PathBuf;

    // Minimal DbConn/DbFactory mocks for plan-table reads.
    mod mock {
        use super::*;
        use dbpulse_db::{DbError, Row};

        pub struct MockDb {
            pub rows: Vec<Row>,
        }

        #[async_trait::async_trait]
        impl DbConn for MockDb {
            async fn ping(&self) -> Result<(), DbError> {
                Ok(())
            }
            async fn query(&self, _sql: &str, _params: &[Param]) -> Result<Vec<Row>, DbError> {
                Ok(self.rows.clone())
            }
            async fn exec(&self, _sql: &str, _params: &[Param]) -> Result<u64, DbError> {
                Ok(0)
            }
        }
    }

    struct NoDbFactory;

    impl DbFactory for NoDbFactory {
        fn make(
            &self,
            _cfg: &MonitorConfig,
        ) -> Result<Arc<dyn DbConn>, dbpulse_db::DbError> {
            Err(dbpulse_db::DbError::Unavailable("no factory in test".into()))
        }
    }

    fn write_temp_plan(name: &str, text: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("dbpulse-plan-{name}-{}.toml", std::process::id()));
        std::fs::write(&path, text).unwrap();
        path
    }

    const SIMPLE: &str = "[levels.l1]\nfreq = \"1s\"\n[levels.l1.collect.\"status.global\"]\nmetrics = [\"queries\"]\n";

    #[tokio::test]
    async fn built_in_plan_when_nothing_configured() {
        let loader = PlanLoader::new(None, false);
        loader
            .load_shared(&PlanSourcesConfig::default(), &NoDbFactory)
            .await
            .unwrap();

        let mon = MonitorConfig {
            hostname: "db1:3306".to_string(),
            ..Default::default()
        };
        loader.load_monitor(&mon, &NoDbFactory).await.unwrap();

        let plan = loader.plan("db1:3306", "").unwrap();
        assert_eq!(plan.name, DEFAULT_PLAN_NAME);
        assert!(plan.levels.contains_key("performance"));
        assert!(plan.validate().is_ok());
    }

    #[tokio::test]
    async fn shared_file_plans_resolve_by_name_and_first() {
        let path = write_temp_plan("shared", SIMPLE);
        let file = path.to_string_lossy().to_string();

        let loader = PlanLoader::new(None, false);
        let cfg = PlanSourcesConfig {
            files: vec![file.clone()],
            ..Default::default()
        };
        loader.load_shared(&cfg, &NoDbFactory).await.unwrap();

        let mon = MonitorConfig {
            hostname: "db1:3306".to_string(),
            ..Default::default()
        };
        loader.load_monitor(&mon, &NoDbFactory).await.unwrap();

        // Empty name: first shared plan via the monitor's shared ref.
        assert_eq!(loader.plan("db1:3306", "").unwrap().name, file);
        // Named: found in the shared list.
        assert_eq!(loader.plan("db1:3306", &file).unwrap().name, file);
        assert!(matches!(
            loader.plan("db1:3306", "nope"),
            Err(PlanError::NotFound { .. })
        ));
        assert!(matches!(
            loader.plan("other", ""),
            Err(PlanError::NoPlans { .. })
        ));

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn plugin_replaces_built_in_sources() {
        let plugin: PlanPluginFn = Arc::new(|_cfg| {
            Ok(vec![Plan::from_toml("from-plugin", SIMPLE).unwrap()])
        });
        let loader = PlanLoader::new(Some(plugin), false);
        loader
            .load_shared(&PlanSourcesConfig::default(), &NoDbFactory)
            .await
            .unwrap();

        let loaded = loader.plans_loaded("");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "from-plugin");
        assert_eq!(loaded[0].source, "plugin");
    }

    #[tokio::test]
    async fn plans_loaded_reports_each_list_with_its_own_entries() {
        let shared_path = write_temp_plan("pl-shared", SIMPLE);
        let mon_a = write_temp_plan("pl-mon-a", SIMPLE);
        let mon_b = write_temp_plan("pl-mon-b", SIMPLE);

        let loader = PlanLoader::new(None, false);
        let cfg = PlanSourcesConfig {
            files: vec![shared_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        loader.load_shared(&cfg, &NoDbFactory).await.unwrap();

        let mut mon = MonitorConfig {
            hostname: "db1:3306".to_string(),
            ..Default::default()
        };
        mon.plans.files = vec![
            mon_a.to_string_lossy().to_string(),
            mon_b.to_string_lossy().to_string(),
        ];
        loader.load_monitor(&mon, &NoDbFactory).await.unwrap();

        // The monitor's list has two entries of its own, not the shared
        // list's single entry.
        let loaded = loader.plans_loaded("db1:3306");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, mon_a.to_string_lossy());
        assert_eq!(loaded[1].name, mon_b.to_string_lossy());
        assert_eq!(loader.plans_loaded("").len(), 1);

        for p in [shared_path, mon_a, mon_b] {
            std::fs::remove_file(p).ok();
        }
    }

    #[tokio::test]
    async fn table_rows_decode_into_plans() {
        let db = MockDb {
            rows: vec![
                vec!["ro".to_string(), SIMPLE.to_string(), "db1".to_string()],
                vec!["rw".to_string(), SIMPLE.to_string(), "db1".to_string()],
            ],
        };
        let plans = read_plan_table("plans", &db, "db1").await.unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].name, "ro");
        assert_eq!(plans[0].monitor_id, "db1");
        assert!(plans[0].levels.contains_key("l1"));
    }
}
