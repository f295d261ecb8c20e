use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::ConfigFile;

/// Resolve a user-supplied path: `~` expands to the home directory, anything
/// else is made absolute against the current working directory.
pub fn resolve_path(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~/").unwrap_or(""));
        }
    }
    let path = PathBuf::from(path);
    std::path::absolute(&path).unwrap_or(path)
}

/// Directory holding nomad's durable state: `~/.nomad`.
pub fn nomad_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".nomad"))
        .unwrap_or_else(|| PathBuf::from(".nomad"))
}

/// Default location of the user config document.
pub fn default_config_path() -> String {
    "~/.nomad/config.json".to_string()
}

/// Load the config document from a JSON file. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        let config: ConfigFile = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?;
        Ok(config)
    } else {
        Ok(ConfigFile::default())
    }
}

/// Overwrite the config document, creating parent directories as needed.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create config directory '{}'",
                parent.to_string_lossy()
            )
        })?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}
