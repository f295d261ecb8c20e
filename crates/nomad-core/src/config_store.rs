use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nomad_config::{
    load_config, merge_config, parse_update, resolve_path, save_config, validate, ConfigError,
    ConfigFile, ConfigFileUpdate,
};
use tracing::{debug, warn};

use crate::bus::{Event, EventBus};

const MAX_RECENT_FOLDERS: usize = 10;

/// Process-wide owner of the user config document.
///
/// The document is read lazily on first access and cached. Every mutation is
/// merged over the cache, validated, written back to disk and announced as
/// `config.appChanged`. Disk failures are logged and absorbed: the cache stays
/// authoritative for the life of the process.
pub struct ConfigStore {
    path: PathBuf,
    bus: Option<EventBus>,
    cache: Mutex<Option<ConfigFile>>,
}

impl ConfigStore {
    pub fn new(config_path: &str, bus: Option<EventBus>) -> Self {
        Self {
            path: resolve_path(config_path),
            bus,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the cached document, reading it from disk on first use.
    pub fn load(&self) -> ConfigFile {
        let mut cache = self.lock();
        self.cached(&mut cache).clone()
    }

    pub fn get(&self) -> ConfigFile {
        self.load()
    }

    /// Apply a full document or a partial update given as raw JSON.
    pub fn update(&self, input: serde_json::Value) -> Result<ConfigFile, ConfigError> {
        let update = parse_update(input)?;
        self.modify(|_| Ok(update))
    }

    /// Derive an update from the current document and commit it atomically
    /// with respect to other mutations.
    ///
    /// `config.appChanged` is published before the cache lock is released, so
    /// subscribers see snapshots in commit order. Bus handlers must not call
    /// back into the store.
    pub fn modify<F>(&self, build: F) -> Result<ConfigFile, ConfigError>
    where
        F: FnOnce(&ConfigFile) -> Result<ConfigFileUpdate, ConfigError>,
    {
        let mut cache = self.lock();
        let current = self.cached(&mut cache);
        let update = build(current)?;
        let merged = merge_config(current, update);
        validate(&merged)?;
        *cache = Some(merged.clone());
        self.persist(&merged);

        debug!("Config updated");
        if let Some(bus) = &self.bus {
            bus.publish(Event::ConfigChanged {
                config: merged.clone(),
            });
        }
        Ok(merged)
    }

    /// Move `folder` to the front of the recent list and stamp the binary's
    /// last launch time.
    pub fn record_launch(&self, folder: &str, binary_path: &str) -> Result<ConfigFile, ConfigError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.modify(|current| {
            let mut folders: Vec<String> = current
                .recent_folders
                .iter()
                .filter(|f| f.as_str() != folder)
                .cloned()
                .collect();
            folders.insert(0, folder.to_string());
            folders.truncate(MAX_RECENT_FOLDERS);

            let mut update = ConfigFileUpdate {
                recent_folders: Some(folders),
                ..Default::default()
            };
            if current.opencode_binaries.iter().any(|b| b.path == binary_path) {
                let binaries = current
                    .opencode_binaries
                    .iter()
                    .cloned()
                    .map(|mut b| {
                        if b.path == binary_path {
                            b.last_used = Some(now);
                        }
                        b
                    })
                    .collect();
                update.opencode_binaries = Some(binaries);
            }
            Ok(update)
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<ConfigFile>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached<'a>(&self, cache: &'a mut Option<ConfigFile>) -> &'a ConfigFile {
        cache.get_or_insert_with(|| self.read_from_disk())
    }

    fn read_from_disk(&self) -> ConfigFile {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No config file found, using defaults");
            return ConfigFile::default();
        }
        let loaded = load_config(&self.path).and_then(|config| {
            validate(&config)?;
            Ok(config)
        });
        match loaded {
            Ok(config) => {
                debug!(path = %self.path.display(), "Loaded existing config file");
                config
            }
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to load config, using defaults: {e:#}");
                ConfigFile::default()
            }
        }
    }

    fn persist(&self, config: &ConfigFile) {
        match save_config(&self.path, config) {
            Ok(()) => debug!(path = %self.path.display(), "Persisted config file"),
            Err(e) => warn!(path = %self.path.display(), "Failed to persist config: {e:#}"),
        }
    }
}
