use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nomad_config::ServerSettings;
use regex::Regex;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ports::PortAllocator;
use super::store::InstanceStore;
use super::supervisor::Supervisor;
use super::{now_millis, Instance, InstanceError, InstanceInfo, InstanceStatus};
use crate::binaries::BinaryRegistry;
use crate::bus::{Event, EventBus};
use crate::config_store::ConfigStore;
use crate::filesystem::open_dir;

/// Control handle for a supervised child.
#[derive(Clone)]
pub(super) struct LiveHandle {
    pid: Option<u32>,
    stop_tx: mpsc::UnboundedSender<()>,
    exited: watch::Receiver<bool>,
}

/// Live instances keyed by id. An entry exists from the moment a create
/// reserves the id until its supervisor has observed the child's exit.
pub(super) type LiveMap = Arc<Mutex<HashMap<String, LiveHandle>>>;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub ready_pattern: Regex,
    pub ready_timeout: Duration,
    pub stop_grace: Duration,
}

impl ManagerSettings {
    pub fn from_server_settings(settings: &ServerSettings) -> Result<Self, regex::Error> {
        Ok(Self {
            ready_pattern: Regex::new(&settings.ready_pattern)?,
            ready_timeout: Duration::from_secs(settings.ready_timeout_secs),
            stop_grace: Duration::from_secs(settings.stop_grace_secs),
        })
    }
}

/// Spawns, tracks and tears down per-workspace agent servers.
pub struct InstanceManager {
    store: Arc<InstanceStore>,
    bus: EventBus,
    config: Arc<ConfigStore>,
    binaries: Arc<BinaryRegistry>,
    ports: PortAllocator,
    settings: ManagerSettings,
    live: LiveMap,
}

impl InstanceManager {
    pub fn new(
        store: Arc<InstanceStore>,
        bus: EventBus,
        config: Arc<ConfigStore>,
        binaries: Arc<BinaryRegistry>,
        ports: PortAllocator,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            binaries,
            ports,
            settings,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Launch an agent server for `folder` and wait until it is ready or has
    /// definitively failed.
    pub async fn create(
        &self,
        id: Option<String>,
        folder: &str,
    ) -> Result<InstanceInfo, InstanceError> {
        let id = id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let folder = open_dir(folder)
            .ok()
            .filter(|dir| std::fs::read_dir(dir).is_ok())
            .ok_or_else(|| InstanceError::FolderNotFound(folder.to_string()))?;
        let folder = folder.to_string_lossy().into_owned();

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        {
            let mut live = self.lock_live();
            if live.contains_key(&id) {
                return Err(InstanceError::AlreadyRunning(id));
            }
            live.insert(
                id.clone(),
                LiveHandle {
                    pid: None,
                    stop_tx,
                    exited: exit_rx,
                },
            );
        }

        let prepared = self.binaries.resolve().ok_or_else(|| {
            InstanceError::BinaryNotFound("no registered binary is usable and none found on PATH".into())
        });
        let binary = match prepared {
            Ok(binary) => binary,
            Err(e) => {
                self.lock_live().remove(&id);
                return Err(e);
            }
        };
        // Bind-testing candidates is blocking socket work.
        let ports = self.ports.clone();
        let allocated = tokio::task::spawn_blocking(move || ports.allocate())
            .await
            .unwrap_or_else(|e| {
                Err(InstanceError::SpawnFailed(format!(
                    "port allocation task failed: {e}"
                )))
            });
        let lease = match allocated {
            Ok(lease) => lease,
            Err(e) => {
                self.lock_live().remove(&id);
                return Err(e);
            }
        };
        let port = lease.port();
        let binary_path = binary.path.to_string_lossy().into_owned();

        let now = now_millis();
        self.store.insert(Instance {
            id: id.clone(),
            folder: folder.clone(),
            port,
            pid: None,
            binary_path: binary_path.clone(),
            status: InstanceStatus::Starting,
            created_at: now,
            updated_at: now,
            last_error: None,
        });

        let env = self.config.get().preferences.environment_variables;
        let mut cmd = Command::new(&binary.path);
        cmd.args(["serve", "--hostname", "127.0.0.1", "--port"])
            .arg(port.to_string())
            .current_dir(&folder)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("failed to spawn {binary_path}: {e}");
                warn!(id = %id, "{reason}");
                self.store
                    .finish(&id, InstanceStatus::Crashed, Some(reason.clone()));
                drop(lease);
                self.lock_live().remove(&id);
                self.bus.publish(Event::InstanceError {
                    id,
                    error: reason.clone(),
                });
                return Err(InstanceError::SpawnFailed(reason));
            }
        };
        let pid = child.id().unwrap_or_default();
        info!(id = %id, pid, port, folder = %folder, binary = %binary_path, "Spawned instance");

        self.store.update(&id, |r| r.pid = Some(pid));
        if let Some(handle) = self.lock_live().get_mut(&id) {
            handle.pid = Some(pid);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let supervisor = Supervisor {
            id: id.clone(),
            port,
            pid,
            binary_path: binary_path.clone(),
            child,
            lease,
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
            live: Arc::clone(&self.live),
            stop_rx,
            exit_tx,
            ready_tx: Some(ready_tx),
            ready_pattern: self.settings.ready_pattern.clone(),
            ready_timeout: self.settings.ready_timeout,
            stop_grace: self.settings.stop_grace,
        };
        tokio::spawn(supervisor.run());

        match ready_rx.await {
            Ok(Ok(())) => {
                if let Err(e) = self.config.record_launch(&folder, &binary.reference) {
                    warn!(id = %id, "Failed to record launch in config: {e}");
                }
                Ok(InstanceInfo {
                    id,
                    port,
                    pid,
                    binary_path,
                })
            }
            Ok(Err(reason)) => Err(InstanceError::SpawnFailed(reason)),
            Err(_) => Err(InstanceError::SpawnFailed(
                "instance supervisor ended unexpectedly".into(),
            )),
        }
    }

    /// Request termination of the instance owning `pid` and wait for its exit.
    /// Unknown or already-stopped pids are ignored.
    pub async fn stop(&self, pid: u32) {
        let handle = self
            .lock_live()
            .values()
            .find(|h| h.pid == Some(pid))
            .cloned();
        let Some(handle) = handle else {
            debug!(pid, "Stop requested for unknown pid");
            return;
        };
        let _ = handle.stop_tx.send(());
        let mut exited = handle.exited;
        let _ = exited.wait_for(|done| *done).await;
    }

    /// Stop every live instance. Used on server exit.
    pub async fn shutdown(&self) {
        let handles: Vec<LiveHandle> = self.lock_live().values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Stopping all instances");
        for handle in &handles {
            let _ = handle.stop_tx.send(());
        }
        for handle in handles {
            let mut exited = handle.exited;
            let _ = exited.wait_for(|done| *done).await;
        }
    }

    pub fn list(&self, include_history: bool) -> Vec<Instance> {
        self.store.list(include_history)
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.store.get(id)
    }

    pub fn live_count(&self) -> usize {
        self.lock_live().len()
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    fn lock_live(&self) -> MutexGuard<'_, HashMap<String, LiveHandle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
