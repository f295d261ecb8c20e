use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nomad_config::{
    resolve_path, BinaryDescriptor, ConfigError, ConfigFile, ConfigFileUpdate, PreferencesUpdate,
};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config_store::ConfigStore;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("binary not found or not executable: {0}")]
    NotFound(String),
    #[error("binary is not registered: {0}")]
    NotRegistered(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Where a resolved binary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySource {
    Preferred,
    Registered,
    SearchPath,
}

#[derive(Debug, Clone)]
pub struct ResolvedBinary {
    /// Executable to spawn.
    pub path: PathBuf,
    /// The configured reference it was resolved from.
    pub reference: String,
    pub source: BinarySource,
}

/// Picks the agent-server executable to launch and manages the registered
/// list kept in the user config.
///
/// Resolution order: the preferred binary, registered binaries in list order,
/// then the configured executable name on `PATH`.
pub struct BinaryRegistry {
    config: Arc<ConfigStore>,
    fallback_name: String,
}

impl BinaryRegistry {
    pub fn new(config: Arc<ConfigStore>, fallback_name: impl Into<String>) -> Self {
        Self {
            config,
            fallback_name: fallback_name.into(),
        }
    }

    pub fn list(&self) -> Vec<BinaryDescriptor> {
        self.config.get().opencode_binaries
    }

    pub fn preferred(&self) -> Option<String> {
        self.config.get().preferences.last_used_binary
    }

    pub fn resolve(&self) -> Option<ResolvedBinary> {
        let config = self.config.get();

        if let Some(preferred) = &config.preferences.last_used_binary {
            match locate(preferred) {
                Some(path) => {
                    return Some(ResolvedBinary {
                        path,
                        reference: preferred.clone(),
                        source: BinarySource::Preferred,
                    })
                }
                None => warn!(binary = %preferred, "Preferred binary is not executable, falling back"),
            }
        }

        for binary in &config.opencode_binaries {
            if let Some(path) = locate(&binary.path) {
                return Some(ResolvedBinary {
                    path,
                    reference: binary.path.clone(),
                    source: BinarySource::Registered,
                });
            }
            debug!(binary = %binary.path, "Skipping unusable registered binary");
        }

        which::which(&self.fallback_name)
            .ok()
            .map(|path| ResolvedBinary {
                path,
                reference: self.fallback_name.clone(),
                source: BinarySource::SearchPath,
            })
    }

    /// Register a binary, recording the version it reports. Re-adding a path
    /// refreshes its label and version.
    pub async fn add(
        &self,
        path: &str,
        label: Option<String>,
    ) -> Result<BinaryDescriptor, RegistryError> {
        let located = locate(path).ok_or_else(|| RegistryError::NotFound(path.to_string()))?;
        let version = probe_version(&located).await;

        let mut descriptor = BinaryDescriptor::new(path);
        descriptor.label = label;
        descriptor.version = version;

        let entry = descriptor.clone();
        self.config.modify(move |current| {
            let mut binaries = current.opencode_binaries.clone();
            match binaries.iter_mut().find(|b| b.path == entry.path) {
                Some(existing) => {
                    existing.label = entry.label.or(existing.label.take());
                    existing.version = entry.version;
                }
                None => binaries.push(entry),
            }
            Ok(ConfigFileUpdate {
                opencode_binaries: Some(binaries),
                ..Default::default()
            })
        })?;
        Ok(descriptor)
    }

    /// Unregister a binary. Clears the preference when it pointed at `path`.
    pub fn remove(&self, path: &str) -> Result<bool, RegistryError> {
        let before = self.config.get().opencode_binaries.len();
        let updated = self.config.modify(|current| {
            let binaries = current
                .opencode_binaries
                .iter()
                .filter(|b| b.path != path)
                .cloned()
                .collect();
            let mut update = ConfigFileUpdate {
                opencode_binaries: Some(binaries),
                ..Default::default()
            };
            if current.preferences.last_used_binary.as_deref() == Some(path) {
                update.preferences = Some(PreferencesUpdate {
                    last_used_binary: Some(String::new()),
                    ..Default::default()
                });
            }
            Ok(update)
        })?;
        Ok(updated.opencode_binaries.len() < before)
    }

    /// Make a registered binary the preferred one.
    pub fn set_default(&self, path: &str) -> Result<ConfigFile, RegistryError> {
        let registered = self.list().iter().any(|b| b.path == path);
        if !registered {
            return Err(RegistryError::NotRegistered(path.to_string()));
        }
        Ok(self.config.modify(|_| {
            Ok(ConfigFileUpdate {
                preferences: Some(PreferencesUpdate {
                    last_used_binary: Some(path.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
        })?)
    }
}

/// Run `<binary> --version` and return the first line of output.
pub async fn probe_version(binary: &Path) -> Option<String> {
    let mut cmd = Command::new(binary);
    cmd.arg("--version").stdin(Stdio::null()).kill_on_drop(true);
    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        }
        Ok(Ok(output)) => {
            debug!(binary = %binary.display(), status = %output.status, "Version probe failed");
            None
        }
        Ok(Err(e)) => {
            debug!(binary = %binary.display(), "Version probe could not run: {e}");
            None
        }
        Err(_) => {
            warn!(binary = %binary.display(), "Version probe timed out");
            None
        }
    }
}

/// Turn a configured binary reference into an executable path. Bare names are
/// looked up on `PATH`.
fn locate(reference: &str) -> Option<PathBuf> {
    if reference.trim().is_empty() {
        return None;
    }
    let has_separator = reference.contains('/') || reference.contains(std::path::MAIN_SEPARATOR);
    if !has_separator && !reference.starts_with('~') {
        return which::which(reference).ok();
    }
    let path = resolve_path(reference);
    is_executable(&path).then_some(path)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
