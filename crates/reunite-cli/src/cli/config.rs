use std::path::{Path, PathBuf};

use anyhow::Result;
use reunite_core::MessagingConfig;

/// `<config dir>/reunite/config.json`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("reunite").join("config.json"))
}

/// An explicit `--config` must load. The default location is optional: when
/// the file is absent the built-in defaults apply.
pub fn resolve_config(explicit: Option<&Path>) -> Result<MessagingConfig> {
    if let Some(path) = explicit {
        return MessagingConfig::load(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            tracing::debug!(path = %path.display(), "using default config file");
            MessagingConfig::load(&path)
        }
        _ => Ok(MessagingConfig::default()),
    }
}
