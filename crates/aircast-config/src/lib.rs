//! Configuration management for aircast
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (`AIRCAST_*` prefix, highest precedence)
//! 2. aircast.local.toml (gitignored, local overrides)
//! 3. aircast.toml (git-tracked, project config)
//! 4. ~/.config/aircast/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main aircast configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AircastConfig {
    pub store: StoreConfig,
    pub broadcast: BroadcastConfig,
    pub livetraffic: LiveTrafficConfig,
    pub queues: QueuesConfig,
}

/// Connection parameters for the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Emit periodic debug lines from dispatchers and the admin thread.
    pub heartbeat: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { heartbeat: false }
    }
}

/// The flight-simulator live feed (UDP forwarding).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveTrafficConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for LiveTrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 49003,
        }
    }
}

/// Queues created at startup when missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// Queue name -> formatter identifier.
    pub defaults: BTreeMap<String, String>,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        let mut defaults = BTreeMap::new();
        defaults.insert("wire".to_string(), "wire".to_string());
        Self { defaults }
    }
}

impl AircastConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }
}
