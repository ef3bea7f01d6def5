//! Level plans: what to collect, and how often.
//!
//! A plan is a named set of levels; each level has a frequency and the
//! domains to collect at that frequency. Plans are declarative TOML,
//! loaded once (and on reload) by the [`loader::PlanLoader`], and never
//! mutated after load — the collector works from a sorted, inherited view
//! built by [`sorted::sorted_levels`] at plan-swap time.

pub mod loader;
pub mod sorted;

use dbpulse_common::config::{interpolate_env_str, parse_duration, MonitorConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan: cannot read {file}: {source}")]
    Io {
        file: String,
        source: std::io::Error,
    },

    #[error("plan: cannot decode {name}: {message}")]
    Parse { name: String, message: String },

    #[error("plan {name}: {message}")]
    Invalid { name: String, message: String },

    #[error("no plans loaded for monitor {monitor_id}")]
    NoPlans { monitor_id: String },

    #[error("monitor {monitor_id} has no plan named {plan}")]
    NotFound { monitor_id: String, plan: String },

    #[error("monitor {monitor_id} uses shared plan {plan} but it was not loaded")]
    SharedNotFound { monitor_id: String, plan: String },

    #[error("plan table: {0}")]
    Db(#[from] dbpulse_db::DbError),
}

/// How one domain is collected at one level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    /// Collector options, keys drawn from the collector's declared schema.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    /// Explicit metric list; empty means the collector's default set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<String>,
}

/// One frequency bucket within a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Level name; filled from the map key after decoding.
    #[serde(skip)]
    pub name: String,
    /// Duration string, e.g. `"5s"`. Must be whole seconds ≥ 1;
    /// `validate` rejects a missing or malformed value.
    #[serde(default)]
    pub freq: String,
    /// Keyed on domain.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub collect: BTreeMap<String, DomainSpec>,
}

/// A named, immutable-after-load collection plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub name: String,
    pub monitor_id: String,
    pub levels: BTreeMap<String, Level>,
}

/// On-disk plan shape: a table of levels.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PlanFile {
    #[serde(default)]
    levels: BTreeMap<String, Level>,
}

impl Plan {
    /// Decode a plan from TOML text.
    pub fn from_toml(name: &str, text: &str) -> Result<Plan, PlanError> {
        let pf: PlanFile = toml::from_str(text).map_err(|e| PlanError::Parse {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        let mut levels = pf.levels;
        for (key, level) in levels.iter_mut() {
            level.name = key.clone();
        }
        Ok(Plan {
            name: name.to_string(),
            monitor_id: String::new(),
            levels,
        })
    }

    /// Encode the plan's levels as TOML text (the inverse of [`Plan::from_toml`]).
    pub fn to_toml(&self) -> String {
        let pf = PlanFile {
            levels: self.levels.clone(),
        };
        toml::to_string(&pf).expect("plan serializes")
    }

    /// Read a plan from a TOML file; the file path is the plan name.
    pub fn from_file(path: &str) -> Result<Plan, PlanError> {
        let text = std::fs::read_to_string(path).map_err(|e| PlanError::Io {
            file: path.to_string(),
            source: e,
        })?;
        Plan::from_toml(path, &text)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.levels.is_empty() {
            return Err(PlanError::Invalid {
                name: self.name.clone(),
                message: "plan has no levels".to_string(),
            });
        }
        for level in self.levels.values() {
            level.freq_secs().map_err(|message| PlanError::Invalid {
                name: self.name.clone(),
                message,
            })?;
        }
        Ok(())
    }

    /// Replace `${ENV_VAR}` in domain option values.
    pub fn interpolate_env(&mut self) {
        self.for_each_option(&mut |v| *v = interpolate_env_str(v));
    }

    /// Replace `%{monitor.FIELD}` in domain option values.
    pub fn interpolate_monitor(&mut self, cfg: &MonitorConfig) {
        let fields: [(&str, String); 4] = [
            ("%{monitor.id}", cfg.id.clone()),
            ("%{monitor.monitor-id}", cfg.monitor_id()),
            ("%{monitor.hostname}", cfg.hostname.clone()),
            ("%{monitor.username}", cfg.username.clone()),
        ];
        self.for_each_option(&mut |v| {
            for (pat, val) in &fields {
                if v.contains(pat) {
                    *v = v.replace(pat, val);
                }
            }
        });
    }

    fn for_each_option(&mut self, f: &mut dyn FnMut(&mut String)) {
        for level in self.levels.values_mut() {
            for dom in level.collect.values_mut() {
                for v in dom.options.values_mut() {
                    f(v);
                }
            }
        }
    }
}

impl Level {
    /// Frequency in whole seconds.
    pub fn freq_secs(&self) -> Result<i64, String> {
        let d = parse_duration(&self.freq)
            .map_err(|e| format!("level {}: {e}", self.name))?;
        let ms = d.as_millis();
        if ms == 0 || ms % 1000 != 0 {
            return Err(format!(
                "level {}: freq must be whole seconds >= 1s, got {}",
                self.name, self.freq
            ));
        }
        Ok((ms / 1000) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_LEVELS: &str = r#"
[levels.fast]
freq = "1s"

[levels.fast.collect."status.global"]
metrics = ["threads_running", "queries"]

[levels.slow]
freq = "5s"

[levels.slow.collect."size.data"]
options = { total = "yes" }
"#;

    #[test]
    fn decode_fills_level_names() {
        let plan = Plan::from_toml("two", TWO_LEVELS).unwrap();
        assert_eq!(plan.levels.len(), 2);
        assert_eq!(plan.levels["fast"].name, "fast");
        assert_eq!(plan.levels["fast"].freq, "1s");
        assert_eq!(
            plan.levels["fast"].collect["status.global"].metrics,
            vec!["threads_running", "queries"]
        );
        assert_eq!(plan.levels["slow"].collect["size.data"].options["total"], "yes");
    }

    #[test]
    fn toml_round_trip_preserves_levels() {
        let plan = Plan::from_toml("two", TWO_LEVELS).unwrap();
        let again = Plan::from_toml("two", &plan.to_toml()).unwrap();
        assert_eq!(plan, again);
    }

    #[test]
    fn validate_rejects_fractional_and_zero_freq() {
        let plan = Plan::from_toml("bad", "[levels.x]\nfreq = \"500ms\"\n").unwrap();
        assert!(plan.validate().is_err());
        let plan = Plan::from_toml("bad", "[levels.x]\nfreq = \"0s\"\n").unwrap();
        assert!(plan.validate().is_err());
        let plan = Plan::from_toml("empty", "").unwrap();
        assert!(plan.validate().is_err());
        let plan = Plan::from_toml("ok", TWO_LEVELS).unwrap();
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn monitor_interpolation_replaces_option_refs() {
        let mut plan = Plan::from_toml(
            "p",
            r#"
[levels.l]
freq = "1s"

[levels.l.collect."size.data"]
options = { exclude = "%{monitor.id}_scratch" }
"#,
        )
        .unwrap();
        let cfg = MonitorConfig {
            id: "db1".to_string(),
            hostname: "h:3306".to_string(),
            ..Default::default()
        };
        plan.interpolate_monitor(&cfg);
        assert_eq!(
            plan.levels["l"].collect["size.data"].options["exclude"],
            "db1_scratch"
        );
    }
}
