mod boot;
mod config;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dbpulse=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());

    let cfg = config::AgentConfig::load(&config_path)?;
    tracing::info!(config = %config_path, "dbpulse-agent starting");

    boot::run(cfg).await
}
