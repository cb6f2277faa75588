//! Configuration for the `layertree` command.
//!
//! Configuration is an optional TOML file:
//!
//! ```toml
//! # Catalog database; omitted means an in-memory catalog.
//! database = "/var/tmp/alpine.sqlite"
//!
//! [engine]
//! # Any docker-compatible CLI.
//! command = "podman"
//! ```
//!
//! Files are searched in this order, and the first one that exists is used:
//! 1. `$LAYERTREE_CONFIG`
//! 2. `$XDG_CONFIG_HOME/layertree/config.toml`
//! 3. `~/.config/layertree/config.toml`
//!
//! Command line flags override values from the file.
//!
//! # Example
//!
//! ```
//! use layertree::Config;
//!
//! let config = Config::from_toml("[engine]\ncommand = \"podman\"")?;
//! assert_eq!(config.engine.command, "podman");
//! assert!(config.database.is_none());
//! # Ok::<(), toml::de::Error>(())
//! ```

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "LAYERTREE_CONFIG";

/// Engine executable used when none is configured.
pub const DEFAULT_ENGINE: &str = "docker";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Path of the catalog database.
    #[serde(default)]
    pub database: Option<PathBuf>,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Container engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Docker-compatible executable, looked up in `PATH` unless absolute.
    #[serde(default = "default_engine")]
    pub command: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine(),
        }
    }
}

fn default_engine() -> String {
    DEFAULT_ENGINE.to_string()
}

impl Config {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// The first configuration file that exists in the search order.
    pub fn find() -> Option<PathBuf> {
        Self::search_paths().into_iter().find(|p| p.is_file())
    }

    /// Candidate configuration files, most specific first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(path) = env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(path));
        }

        if let Ok(xdg_config) = env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg_config).join("layertree/config.toml"));
        }

        if let Ok(home) = env::var("HOME") {
            paths.push(PathBuf::from(home).join(".config/layertree/config.toml"));
        }

        paths
    }
}
