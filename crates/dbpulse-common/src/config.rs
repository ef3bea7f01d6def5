//! Monitor configuration: the fully resolved description of one database
//! instance to monitor.
//!
//! Configs arrive from several sources (inline config, files, cloud
//! discovery, plugins). The loader finalizes each one the same way:
//! defaults, env interpolation, monitor-field interpolation, monitor-id
//! assignment, then validation. A finalized config is immutable for the
//! lifetime of its monitor; change detection is by content hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Parse a duration string like `"1s"`, `"5s"`, `"2m"`, `"500ms"`, `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => return Err(format!("duration {s} has no unit (use ms, s, m, or h)")),
    };
    let n: u64 = num.parse().map_err(|_| format!("invalid duration: {s}"))?;
    let ms = match unit {
        "ms" => n,
        "s" => n * 1_000,
        "m" => n * 60_000,
        "h" => n * 3_600_000,
        _ => return Err(format!("duration {s} has unknown unit {unit}")),
    };
    Ok(Duration::from_millis(ms))
}

/// Dwell and target plan for one instance state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateChangeConfig {
    /// How long the observed state must hold before the plan changes.
    #[serde(default)]
    pub after: String,
    /// Plan to switch to; empty means "pause collection in this state".
    #[serde(default)]
    pub plan: String,
}

/// Per-state plan adjustment: `monitors.*.plans.adjust`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanAdjustConfig {
    #[serde(default)]
    pub offline: StateChangeConfig,
    #[serde(default)]
    pub standby: StateChangeConfig,
    #[serde(default, rename = "read-only")]
    pub read_only: StateChangeConfig,
    #[serde(default)]
    pub active: StateChangeConfig,
}

impl PlanAdjustConfig {
    /// Adjusting is enabled when any state names a plan.
    pub fn enabled(&self) -> bool {
        !self.offline.plan.is_empty()
            || !self.standby.plan.is_empty()
            || !self.read_only.plan.is_empty()
            || !self.active.plan.is_empty()
    }
}

/// Plan sources for one monitor: `monitors.*.plans`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorPlansConfig {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub adjust: PlanAdjustConfig,
}

/// Heartbeat writer settings: `monitors.*.heartbeat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Write frequency (e.g. `"2s"`); empty disables the writer.
    #[serde(default)]
    pub freq: String,
    #[serde(default)]
    pub table: String,
}

pub const DEFAULT_HEARTBEAT_TABLE: &str = "dbpulse.heartbeat";

/// Fully resolved configuration for one monitored instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Explicit monitor id; derived from hostname/socket when empty.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub socket: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Ordered so the content hash is stable for equal configs.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub plans: MonitorPlansConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Keyed on sink name; values are sink-specific options.
    #[serde(default)]
    pub sinks: BTreeMap<String, BTreeMap<String, String>>,
}

/// Agent-wide defaults applied to every monitor before interpolation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorDefaults {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl MonitorConfig {
    /// Fill empty fields from agent-wide defaults.
    pub fn apply_defaults(&mut self, defaults: &MonitorDefaults) {
        if self.username.is_empty() {
            self.username = defaults.username.clone();
        }
        if self.password.is_empty() {
            self.password = defaults.password.clone();
        }
        if !self.heartbeat.freq.is_empty() && self.heartbeat.table.is_empty() {
            self.heartbeat.table = DEFAULT_HEARTBEAT_TABLE.to_string();
        }
    }

    /// Replace `${ENV_VAR}` references in all string fields.
    pub fn interpolate_env(&mut self) {
        self.for_each_field(&mut |v| *v = interpolate_env_str(v));
    }

    /// Replace `%{monitor.FIELD}` references in all string fields.
    ///
    /// Field values are taken from this config as it stands, so env
    /// interpolation must run first.
    pub fn interpolate_monitor(&mut self) {
        let fields = self.field_map();
        self.for_each_field(&mut |v| *v = interpolate_monitor_str(v, &fields));
    }

    /// The stable monitor id: explicit id, else hostname, else socket.
    ///
    /// Called after interpolation so ids derive from final values.
    pub fn monitor_id(&self) -> String {
        if !self.id.is_empty() {
            self.id.clone()
        } else if !self.hostname.is_empty() {
            self.hostname.clone()
        } else {
            self.socket.clone()
        }
    }

    /// SHA-256 over the canonical JSON form. Any change anywhere in the
    /// config yields a different monitor; detecting *what* changed is
    /// deliberately out of scope.
    pub fn content_hash(&self) -> String {
        let json = serde_json::to_string(self).expect("config serializes");
        let digest = Sha256::digest(json.as_bytes());
        format!("{digest:x}")
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.hostname.is_empty() && self.socket.is_empty() {
            return Err(format!(
                "monitor {}: hostname or socket required",
                self.monitor_id()
            ));
        }
        if !self.heartbeat.freq.is_empty() {
            let freq = parse_duration(&self.heartbeat.freq)
                .map_err(|e| format!("monitor {}: heartbeat.freq: {e}", self.monitor_id()))?;
            if freq.is_zero() {
                return Err(format!(
                    "monitor {}: heartbeat.freq must be > 0",
                    self.monitor_id()
                ));
            }
        }
        for (state, sc) in [
            ("offline", &self.plans.adjust.offline),
            ("standby", &self.plans.adjust.standby),
            ("read-only", &self.plans.adjust.read_only),
            ("active", &self.plans.adjust.active),
        ] {
            if !sc.after.is_empty() {
                parse_duration(&sc.after).map_err(|e| {
                    format!("monitor {}: plans.adjust.{state}.after: {e}", self.monitor_id())
                })?;
            }
        }
        Ok(())
    }

    fn field_map(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("id", self.id.clone()),
            ("monitor-id", self.monitor_id()),
            ("hostname", self.hostname.clone()),
            ("socket", self.socket.clone()),
            ("username", self.username.clone()),
        ])
    }

    fn for_each_field(&mut self, f: &mut dyn FnMut(&mut String)) {
        f(&mut self.hostname);
        f(&mut self.socket);
        f(&mut self.username);
        f(&mut self.password);
        f(&mut self.heartbeat.table);
        for v in self.tags.values_mut() {
            f(v);
        }
        for file in &mut self.plans.files {
            f(file);
        }
        for opts in self.sinks.values_mut() {
            for v in opts.values_mut() {
                f(v);
            }
        }
    }
}

/// Replace `${VAR}` with the environment value, or leave the reference
/// in place when the variable is unset.
pub fn interpolate_env_str(s: &str) -> String {
    interpolate(s, "${", |name| std::env::var(name).ok())
}

fn interpolate_monitor_str(s: &str, fields: &HashMap<&'static str, String>) -> String {
    interpolate(s, "%{", |name| {
        name.strip_prefix("monitor.")
            .and_then(|f| fields.get(f).cloned())
    })
}

fn interpolate(s: &str, open: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        let after = &rest[start + open.len()..];
        match after.find('}') {
            Some(end) => {
                match lookup(&after[..end]) {
                    Some(v) => out.push_str(&v),
                    None => {
                        out.push_str(open);
                        out.push_str(&after[..end]);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(open);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parsed `monitor_loader.stop_loss` thresholds.
///
/// `"50%"` sets the percent limit; a bare number sets the absolute limit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StopLoss {
    pub percent: f64,
    pub number: u64,
}

pub fn parse_stop_loss(s: &str) -> Result<StopLoss, String> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(StopLoss::default());
    }
    if let Some(pct) = s.strip_suffix('%') {
        let p: f64 = pct.trim().parse().map_err(|_| format!("invalid stop-loss: {s}"))?;
        if !(0.0..=100.0).contains(&p) {
            return Err(format!("stop-loss percent out of range: {s}"));
        }
        return Ok(StopLoss { percent: p / 100.0, number: 0 });
    }
    let n: u64 = s.parse().map_err(|_| format!("invalid stop-loss: {s}"))?;
    Ok(StopLoss { percent: 0.0, number: n })
}
