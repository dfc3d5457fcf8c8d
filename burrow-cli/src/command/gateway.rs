use anyhow::{Context, Result};
use burrow::{Gateway, GatewayConfig, Interval};
use tracing::info;

use crate::config::Config;

/// Run the public gateway
#[derive(Debug, clap::Args)]
pub struct Args {
    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Public path to accept, repeatable (default: any path)
    #[arg(long = "path", value_name = "PATH")]
    paths: Vec<String>,

    /// Path agents register on
    #[arg(long)]
    register_path: Option<String>,

    /// Bearer token agents must present
    #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Heartbeat interval in milliseconds, 0 disables
    #[arg(long, value_name = "MS")]
    heartbeat: Option<u64>,

    /// Drop envelopes sent by a link the connection is not routed to
    #[arg(long)]
    strict_routing: bool,
}

impl Args {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.paths.is_empty() {
            config.paths = self.paths.clone();
        }
        if let Some(register_path) = &self.register_path {
            config.register_path = register_path.clone();
        }
        if let Some(token) = &self.token {
            config.register_token = Some(token.clone());
        }
        if let Some(heartbeat) = self.heartbeat {
            config.heartbeat = Interval::Millis(heartbeat);
        }
        if self.strict_routing {
            config.strict_routing = true;
        }
    }
}

pub async fn execute(args: &Args, config: Config) -> Result<()> {
    let mut config = config.gateway;
    args.apply(&mut config);

    let gateway = Gateway::new(config);
    tokio::select! {
        result = gateway.run() => result.context("Gateway stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }
    Ok(())
}
