//! The scrivener server binary: configuration comes from `SCRIVENER_*`
//! environment variables, logging from `RUST_LOG` / `LOG_FORMAT`.

use scrivener::agent::Agent;
use scrivener::config::AgentConfig;
use scrivener::telemetry::{init_logging, LogFormat};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(LogFormat::from_env())?;

    let config = AgentConfig::from_env()?;
    let agent = Agent::new(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    agent.shutdown().await?;
    Ok(())
}
