//! Host configuration: TOML file (or defaults) plus environment overrides.

use anyhow::{Context, Result};
use backup_engine::config::{Config, KeyStoreKind};
use std::path::{Path, PathBuf};

pub const ENV_DATA_DIR: &str = "CLEANUP_DATA_DIR";
pub const ENV_LOG_LEVEL: &str = "CLEANUP_LOG_LEVEL";
pub const ENV_KEY_STORE: &str = "CLEANUP_KEY_STORE";

/// Load configuration from `path` (or defaults), then apply `.env` and
/// process environment overrides.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let _ = dotenvy::dotenv();

    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Apply overrides looked up through `var`
pub fn apply_overrides<F>(config: &mut Config, var: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = var(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
        config.storage.data_dir = PathBuf::from(dir);
    }

    if let Some(level) = var(ENV_LOG_LEVEL).filter(|v| !v.is_empty()) {
        config.log.level = level;
    }

    if let Some(kind) = var(ENV_KEY_STORE).filter(|v| !v.is_empty()) {
        config.encryption.key_store = kind
            .parse::<KeyStoreKind>()
            .with_context(|| format!("Invalid {}", ENV_KEY_STORE))?;
    }

    Ok(())
}
