//! Daemon configuration loading
//!
//! Settings come from an optional configuration file (format chosen by its
//! extension) and are overridden by `MOM__SECTION__KEY` environment
//! variables. Underscores in the key map to the dashes of the file keys, so
//! `MOM__POLICY__GRACE_PERIOD=5` sets `[policy] grace-period`.

use anyhow::{Context, Result};
use mom_lib::config::{GuestConfig, HostConfig};
use serde::de::DeserializeOwned;
use std::path::Path;

const ENV_PREFIX: &str = "MOM__";

/// Load the host daemon configuration
pub fn load_host_config(path: Option<&Path>) -> Result<HostConfig> {
    load(path, std::env::vars())
}

/// Load the guest daemon configuration
pub fn load_guest_config(path: Option<&Path>) -> Result<GuestConfig> {
    load(path, std::env::vars())
}

/// `MOM__GUEST_MONITOR__INTERVAL` → `guest-monitor.interval`
fn env_key(name: &str) -> Option<String> {
    let rest = name.strip_prefix(ENV_PREFIX)?;
    let parts: Vec<String> = rest
        .split("__")
        .map(|part| part.to_lowercase().replace('_', "-"))
        .collect();
    if parts.iter().any(|part| part.is_empty()) {
        return None;
    }
    Some(parts.join("."))
}

pub fn load<T, I>(path: Option<&Path>, vars: I) -> Result<T>
where
    T: DeserializeOwned,
    I: IntoIterator<Item = (String, String)>,
{
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    for (name, value) in vars {
        if let Some(key) = env_key(&name) {
            builder = builder
                .set_override(key, value)
                .with_context(|| format!("Invalid override {}", name))?;
        }
    }

    let config = builder.build().context("Failed to read configuration")?;
    config
        .try_deserialize()
        .context("Failed to parse configuration")
}
