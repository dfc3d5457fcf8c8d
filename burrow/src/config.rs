use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::envelope::{Codec, DEFAULT_MAGIC};
use crate::util;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(3600);
pub const DEFAULT_RECONNECT: Duration = Duration::from_millis(3000);

/// A timer setting: `false`/`0` disables it, `true` picks the default period,
/// a number is a period in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Interval {
    Enabled(bool),
    Millis(u64),
}

impl Default for Interval {
    fn default() -> Self {
        Interval::Enabled(false)
    }
}

impl Interval {
    pub fn period(self, default: Duration) -> Option<Duration> {
        match self {
            Interval::Enabled(false) | Interval::Millis(0) => None,
            Interval::Enabled(true) => Some(default),
            Interval::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

fn default_magic() -> Vec<u8> {
    DEFAULT_MAGIC.to_vec()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Public paths; empty accepts any path.
    pub paths: Vec<String>,
    pub register_path: String,
    pub register_token: Option<String>,
    pub heartbeat: Interval,
    /// Only accept envelopes for a connection from the link it is routed to.
    pub strict_routing: bool,
    pub magic: Vec<u8>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            paths: Vec::new(),
            register_path: "/register".to_string(),
            register_token: None,
            heartbeat: Interval::default(),
            strict_routing: false,
            magic: default_magic(),
        }
    }
}

impl GatewayConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn codec(&self) -> Codec {
        Codec::new(self.magic.clone())
    }

    pub fn is_register_path(&self, path: &str) -> bool {
        util::normalize_path(&self.register_path) == path
    }

    pub fn accepts_path(&self, path: &str) -> bool {
        self.paths.is_empty() || self.paths.iter().any(|p| util::normalize_path(p) == path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Gateway registration URI, e.g. `ws://gateway:8080/register`.
    pub server: String,
    pub token: Option<String>,
    /// Base URI of the private target service.
    pub target: String,
    pub heartbeat: Interval,
    pub reconnect: Interval,
    pub magic: Vec<u8>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            token: None,
            target: String::new(),
            heartbeat: Interval::default(),
            reconnect: Interval::Enabled(true),
            magic: default_magic(),
        }
    }
}

impl AgentConfig {
    pub fn codec(&self) -> Codec {
        Codec::new(self.magic.clone())
    }
}
