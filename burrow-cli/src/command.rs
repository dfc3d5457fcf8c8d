pub mod agent;
pub mod gateway;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Accept public WebSocket clients and agents
    Gateway(gateway::Args),

    /// Connect to a gateway and serve its clients from a private target
    Agent(agent::Args),
}
