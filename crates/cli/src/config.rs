//! Configuration loading for depotctl.

use anyhow::{Context, Result};
use depot_core::SwiftStoreConfig;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "depot.toml";

/// Environment variables with this prefix override file settings,
/// e.g. `DEPOT_AUTH_ADDRESS=https://swift.example.com/v1`.
pub const ENV_PREFIX: &str = "DEPOT_";

/// Load the store configuration.
///
/// The file is optional; environment variables can provide everything.
pub fn load_config(path: &Path) -> Result<SwiftStoreConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }

    let config: SwiftStoreConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}
