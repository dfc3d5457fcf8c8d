use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burrow::{AgentConfig, GatewayConfig};
use serde::Deserialize;

use crate::sys;

const USER_PATH: &str = "burrow/config.toml";

/// Settings for both subcommands, layered from the config file and
/// `BURROW_<SECTION>__<KEY>` environment variables.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
}

impl Config {
    pub fn user_path() -> Option<PathBuf> {
        sys::config_dir().map(|config_dir| config_dir.join(USER_PATH))
    }

    /// Load from `path` if given (it must exist), otherwise from the user
    /// config file when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(::config::File::from(path));
            }
            None => {
                if let Some(path) = Self::user_path() {
                    builder = builder.add_source(::config::File::from(path).required(false));
                }
            }
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("BURROW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("gateway.paths"),
        );

        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }
}
