use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use livelink::LinkConfig;
use tracing::debug;

/// `<config dir>/livelink/config.toml`, when a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("livelink").join("config.toml"))
}

/// Load the configuration from `path`, or from the default location when it
/// exists, then apply environment overrides and validate.
pub fn load(path: Option<&Path>) -> Result<LinkConfig> {
    let mut config = match path {
        Some(path) => read(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => read(&path)?,
            None => {
                debug!("No configuration file, using defaults");
                LinkConfig::default()
            }
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn read(path: &Path) -> Result<LinkConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Replace strategy API keys with `LIVELINK_<NAME>_API_KEY` values.
pub fn apply_env_overrides(config: &mut LinkConfig, lookup: impl Fn(&str) -> Option<String>) {
    for strategy in &mut config.strategies {
        let var = strategy.api_key_env_var();
        if let Some(key) = lookup(&var).filter(|v| !v.trim().is_empty()) {
            debug!(strategy = %strategy.name, var = %var, "API key taken from environment");
            strategy.api_key = Some(key);
        }
    }
}
