use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Process-level settings for the nomad server. Unlike [`crate::ConfigFile`]
/// these are not editable by clients and are never broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Path of the user config document. Supports `~/`.
    pub config_path: String,
    /// SQLite file holding instance records. Supports `~/`.
    pub instance_db_path: String,
    pub port_range: PortRange,
    /// Bind-test attempts before allocation gives up.
    pub max_port_attempts: u32,
    pub ready_timeout_secs: u64,
    /// Time between SIGTERM and a hard kill.
    pub stop_grace_secs: u64,
    /// Regex matched against child output to detect readiness.
    pub ready_pattern: String,
    /// Keep stopped/crashed records for display.
    pub retain_history: bool,
    /// Executable looked up on PATH when no binary is registered.
    pub binary_name: String,
    /// Command printing a chosen directory on stdout, for the shell folder picker.
    pub folder_picker_command: Option<Vec<String>>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9898,
            config_path: crate::loader::default_config_path(),
            instance_db_path: "~/.nomad/instances.db".into(),
            port_range: PortRange::default(),
            max_port_attempts: 200,
            ready_timeout_secs: 30,
            stop_grace_secs: 5,
            ready_pattern: "(?i)server listening on".into(),
            retain_history: true,
            binary_name: "opencode".into(),
            folder_picker_command: None,
        }
    }
}

impl ServerSettings {
    /// Reject settings the instance manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.port_range.start != 0,
            "portRange.start must be at least 1"
        );
        ensure!(
            !self.port_range.is_empty(),
            "portRange is empty ({}-{})",
            self.port_range.start,
            self.port_range.end
        );
        ensure!(self.max_port_attempts > 0, "maxPortAttempts must be positive");
        Ok(())
    }
}

/// Inclusive candidate range scanned for instance ports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 41000,
            end: 41999,
        }
    }
}

impl PortRange {
    pub fn len(&self) -> u32 {
        if self.end < self.start {
            0
        } else {
            u32::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Find a settings file: `./nomad.json`, then `~/.nomad/nomad.json`.
pub fn find_settings_path() -> Option<PathBuf> {
    let local = Path::new("nomad.json");
    if local.exists() {
        return Some(local.to_path_buf());
    }
    let home = crate::loader::nomad_home().join("nomad.json");
    home.exists().then_some(home)
}

/// Load server settings from a JSON file. A missing file yields defaults.
pub fn load_settings(path: &Path) -> Result<ServerSettings> {
    if !path.exists() {
        return Ok(ServerSettings::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings '{}'", path.display()))?;
    let settings: ServerSettings = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse settings '{}'", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings '{}'", path.display()))?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_fill_defaults() {
        let settings: ServerSettings = serde_json::from_value(serde_json::json!({
            "port": 7000,
            "portRange": { "start": 50000, "end": 50010 }
        }))
        .unwrap();
        assert_eq!(settings.port, 7000);
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port_range.len(), 11);
        assert!(settings.retain_history);
    }

    #[test]
    fn inverted_range_is_empty() {
        let range = PortRange {
            start: 10,
            end: 5,
        };
        assert!(range.is_empty());
    }

    #[test]
    fn load_settings_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nomad.json");
        std::fs::write(&path, r#"{"readyTimeoutSecs": 3, "retainHistory": false}"#).unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.ready_timeout_secs, 3);
        assert!(!settings.retain_history);
        assert_eq!(settings.binary_name, "opencode");
    }

    #[test]
    fn port_range_starting_at_zero_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nomad.json");
        std::fs::write(&path, r#"{"portRange": {"start": 0, "end": 10}}"#).unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(format!("{err:#}").contains("portRange.start"));
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let settings = ServerSettings {
            port_range: PortRange {
                start: 50010,
                end: 50000,
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        assert!(ServerSettings::default().validate().is_ok());
    }
}
