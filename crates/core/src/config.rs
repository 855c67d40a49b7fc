//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default container for stored images.
pub const DEFAULT_CONTAINER: &str = "glance";

/// Payloads at or above this size are split into segments: 5 GiB.
pub const DEFAULT_LARGE_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Segment size for large objects: 200 MiB.
pub const DEFAULT_LARGE_OBJECT_CHUNK_SIZE: u64 = 200 * 1024 * 1024;

/// Swift store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SwiftStoreConfig {
    /// Swift user, typically `account:user`.
    #[serde(default)]
    pub user: Option<String>,
    /// Swift key for `user`.
    /// WARNING: Prefer the DEPOT_KEY env var over storing the key in a config file.
    #[serde(default)]
    pub key: Option<String>,
    /// Auth endpoint: `host[:port][/prefix]`, optionally with an `http://` or
    /// `https://` protocol. Bare hosts use HTTPS.
    #[serde(default)]
    pub auth_address: Option<String>,
    /// Container images are written to.
    #[serde(default = "default_container")]
    pub container: String,
    /// Create the container on the first add if it does not exist (default: false).
    #[serde(default)]
    pub create_container_on_put: bool,
    /// Payloads of at least this many bytes are stored as segmented large objects.
    #[serde(default = "default_large_object_size")]
    pub large_object_size: u64,
    /// Segment size in bytes for large objects.
    #[serde(default = "default_large_object_chunk_size")]
    pub large_object_chunk_size: u64,
}

fn default_container() -> String {
    DEFAULT_CONTAINER.to_string()
}

fn default_large_object_size() -> u64 {
    DEFAULT_LARGE_OBJECT_SIZE
}

fn default_large_object_chunk_size() -> u64 {
    DEFAULT_LARGE_OBJECT_CHUNK_SIZE
}

impl Default for SwiftStoreConfig {
    fn default() -> Self {
        Self {
            user: None,
            key: None,
            auth_address: None,
            container: default_container(),
            create_container_on_put: false,
            large_object_size: default_large_object_size(),
            large_object_chunk_size: default_large_object_chunk_size(),
        }
    }
}

impl std::fmt::Debug for SwiftStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwiftStoreConfig")
            .field("user", &self.user)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("auth_address", &self.auth_address)
            .field("container", &self.container)
            .field("create_container_on_put", &self.create_container_on_put)
            .field("large_object_size", &self.large_object_size)
            .field("large_object_chunk_size", &self.large_object_chunk_size)
            .finish()
    }
}

impl SwiftStoreConfig {
    /// Option names understood by [`SwiftStoreConfig::from_options`].
    pub const OPTION_USER: &'static str = "store_user";
    pub const OPTION_KEY: &'static str = "store_key";
    pub const OPTION_AUTH_ADDRESS: &'static str = "store_auth_address";
    pub const OPTION_CONTAINER: &'static str = "store_container";
    pub const OPTION_CREATE_CONTAINER_ON_PUT: &'static str = "store_create_container_on_put";
    pub const OPTION_LARGE_OBJECT_SIZE: &'static str = "store_large_object_size";
    pub const OPTION_LARGE_OBJECT_CHUNK_SIZE: &'static str = "store_large_object_chunk_size";

    /// Build a configuration from a flat option map.
    ///
    /// Unknown options are ignored so a shared option map can carry settings
    /// for other components.
    pub fn from_options(options: &HashMap<String, String>) -> crate::Result<Self> {
        let mut config = Self::default();
        let get = |name: &str| {
            options
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        config.user = get(Self::OPTION_USER).map(str::to_string);
        config.key = get(Self::OPTION_KEY).map(str::to_string);
        config.auth_address = get(Self::OPTION_AUTH_ADDRESS).map(str::to_string);
        if let Some(container) = get(Self::OPTION_CONTAINER) {
            config.container = container.to_string();
        }
        if let Some(value) = get(Self::OPTION_CREATE_CONTAINER_ON_PUT) {
            config.create_container_on_put = parse_bool(value).ok_or_else(|| {
                invalid_option(Self::OPTION_CREATE_CONTAINER_ON_PUT, value)
            })?;
        }
        if let Some(value) = get(Self::OPTION_LARGE_OBJECT_SIZE) {
            config.large_object_size = value
                .parse()
                .map_err(|_| invalid_option(Self::OPTION_LARGE_OBJECT_SIZE, value))?;
        }
        if let Some(value) = get(Self::OPTION_LARGE_OBJECT_CHUNK_SIZE) {
            config.large_object_chunk_size = value
                .parse()
                .map_err(|_| invalid_option(Self::OPTION_LARGE_OBJECT_CHUNK_SIZE, value))?;
        }

        config.validate().map_err(crate::Error::Config)?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// Missing credentials are not an error: they put the store into
    /// read-only mode instead.
    pub fn validate(&self) -> Result<(), String> {
        if self.container.trim().is_empty() {
            return Err("store container must not be empty".to_string());
        }
        if self.container.contains('/') {
            return Err(format!(
                "store container '{}' must not contain '/'",
                self.container
            ));
        }
        if self.large_object_size == 0 {
            return Err("large_object_size must be greater than zero".to_string());
        }
        if self.large_object_chunk_size == 0 {
            return Err("large_object_chunk_size must be greater than zero".to_string());
        }
        if usize::try_from(self.large_object_chunk_size).is_err() {
            return Err(format!(
                "large_object_chunk_size {} does not fit in memory on this platform",
                self.large_object_chunk_size
            ));
        }
        Ok(())
    }

    /// Names of the credential settings that are not configured.
    ///
    /// Adding images requires all three of user, key and auth address.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if is_blank(&self.user) {
            missing.push("user");
        }
        if is_blank(&self.key) {
            missing.push("key");
        }
        if is_blank(&self.auth_address) {
            missing.push("auth_address");
        }
        missing
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid_option(name: &str, value: &str) -> crate::Error {
    crate::Error::Config(format!("invalid value '{value}' for option {name}"))
}
