use std::sync::Arc;

use anyhow::{Context, Result};
use nomad_config::{resolve_path, ServerSettings};
use nomad_core::{
    BinaryRegistry, ConfigStore, EventBus, FileSystemBrowser, InstanceManager, InstanceStore,
    ManagerSettings, PortAllocator,
};
use serde::Serialize;

/// Static facts about the running server, served at `/api/meta`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMeta {
    pub version: String,
    pub host: String,
    pub port: u16,
    pub config_path: String,
    pub workspace_root: String,
}

/// The core services every transport relays to.
#[derive(Clone)]
pub struct AppContext {
    pub bus: EventBus,
    pub config: Arc<ConfigStore>,
    pub binaries: Arc<BinaryRegistry>,
    pub instances: Arc<InstanceManager>,
    pub filesystem: FileSystemBrowser,
    pub meta: ServerMeta,
}

impl AppContext {
    /// Wire up the core from server settings.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        settings.validate()?;
        let manager_settings = ManagerSettings::from_server_settings(settings)
            .with_context(|| format!("invalid readyPattern '{}'", settings.ready_pattern))?;

        let bus = EventBus::new();
        let config = Arc::new(ConfigStore::new(&settings.config_path, Some(bus.clone())));
        let binaries = Arc::new(BinaryRegistry::new(
            Arc::clone(&config),
            settings.binary_name.clone(),
        ));
        let store = Arc::new(InstanceStore::open(
            &resolve_path(&settings.instance_db_path),
            settings.retain_history,
        ));
        let instances = Arc::new(InstanceManager::new(
            store,
            bus.clone(),
            Arc::clone(&config),
            Arc::clone(&binaries),
            PortAllocator::new(settings.port_range, settings.max_port_attempts),
            manager_settings,
        ));

        let meta = ServerMeta {
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: settings.host.clone(),
            port: settings.port,
            config_path: config.path().to_string_lossy().into_owned(),
            workspace_root: resolve_path("~").to_string_lossy().into_owned(),
        };

        Ok(Self {
            bus,
            config,
            binaries,
            instances,
            filesystem: FileSystemBrowser::default(),
            meta,
        })
    }
}
