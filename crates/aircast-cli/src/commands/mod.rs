//! CLI command implementations.

pub mod queue;
pub mod start;

use anyhow::{Context, Result};

use aircast_config::{AircastConfig, ConfigLoader};
use aircast_store::RedisStore;

/// Loads configuration, applying CLI overrides.
pub fn load_config(config_dir: Option<&str>, store_url: Option<String>) -> Result<AircastConfig> {
    let loader = match config_dir {
        Some(dir) => ConfigLoader::new().with_project_dir(dir),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;
    if let Some(url) = store_url {
        config.store.url = url;
    }
    Ok(config)
}

/// Connects to the configured store.
pub fn connect(config: &AircastConfig) -> Result<RedisStore> {
    RedisStore::connect(&config.store.url)
        .with_context(|| format!("connecting to store at {}", config.store.url))
}
