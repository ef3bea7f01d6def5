use dbpulse_common::config::{MonitorConfig, MonitorDefaults};
use dbpulse_monitor::loader::MonitorLoaderConfig;
use dbpulse_plan::loader::PlanSourcesConfig;
use serde::Deserialize;

/// Top-level agent configuration (`agent.toml`).
#[derive(Debug, Default, Deserialize)]
pub struct AgentConfig {
    /// Strict mode: configuration problems abort instead of being
    /// skipped.
    #[serde(default)]
    pub strict: bool,

    /// Defaults applied to every monitor.
    #[serde(default)]
    pub defaults: MonitorDefaults,

    /// Shared plan sources.
    #[serde(default)]
    pub plans: PlanSourcesConfig,

    /// Inline monitors.
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,

    /// Monitor files, reload period, stop-loss.
    #[serde(default)]
    pub monitor_loader: MonitorLoaderConfig,
}

impl AgentConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {path}: {e}"))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("{path}: invalid TOML: {e}"))?;
        Ok(config)
    }
}
