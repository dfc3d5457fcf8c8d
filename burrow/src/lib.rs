//! Reverse WebSocket tunnel.
//!
//! A [`Gateway`] accepts public WebSocket connections and relays them over
//! transfer links that [`Agent`]s open from inside a private network. Each
//! agent dials the private target service on behalf of every public client.

pub mod agent;
pub mod config;
pub mod error;
pub mod gateway;
pub mod id;
pub mod registry;
pub mod router;
pub mod transport;
pub mod util;

pub use agent::Agent;
pub use config::{AgentConfig, GatewayConfig, Interval};
pub use error::{Error, Result};
pub use gateway::Gateway;
