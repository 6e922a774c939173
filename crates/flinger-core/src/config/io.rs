//! YAML configuration persistence
//!
//! Works with any serde configuration type. A missing or unreadable file is
//! not fatal: the engine falls back to defaults and logs why.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Load configuration from a YAML file
///
/// Returns `T::default()` if the file is missing, and logs a warning and
/// returns the default if it cannot be read or parsed.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    log::info!("load_config: reading {:?}", path);

    if !path.exists() {
        log::info!("load_config: {:?} not found, using defaults", path);
        return T::default();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            log::warn!("load_config: cannot read {:?}: {}, using defaults", path, e);
            return T::default();
        }
    };

    serde_yaml::from_str::<T>(&contents).unwrap_or_else(|e| {
        log::warn!("load_config: cannot parse {:?}: {}, using defaults", path, e);
        T::default()
    })
}

/// Save configuration to a YAML file, creating parent directories as needed
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("save_config: wrote {:?}", path);
    Ok(())
}
