use anyhow::{Context, Result};
use burrow::{Agent, AgentConfig, Interval};
use tracing::info;

use crate::config::Config;

/// Run an agent next to the private service
#[derive(Debug, clap::Args)]
pub struct Args {
    /// Gateway registration URI, e.g. ws://gateway:8080/register
    #[arg(short, long)]
    server: Option<String>,

    /// Bearer token to present to the gateway
    #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Base URI of the private WebSocket service
    #[arg(short, long)]
    target: Option<String>,

    /// Heartbeat interval in milliseconds, 0 disables
    #[arg(long, value_name = "MS")]
    heartbeat: Option<u64>,

    /// Delay before reconnecting in milliseconds, 0 disables
    #[arg(long, value_name = "MS")]
    reconnect: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(target) = &self.target {
            config.target = target.clone();
        }
        if let Some(heartbeat) = self.heartbeat {
            config.heartbeat = Interval::Millis(heartbeat);
        }
        if let Some(reconnect) = self.reconnect {
            config.reconnect = Interval::Millis(reconnect);
        }
    }
}

pub async fn execute(args: &Args, config: Config) -> Result<()> {
    let mut config = config.agent;
    args.apply(&mut config);

    let agent = Agent::new(config).context("Invalid agent configuration")?;
    info!("Agent connecting to {}", agent.server());
    tokio::select! {
        result = agent.run() => result.context("Agent stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }
    Ok(())
}
