pub mod manager;
pub mod ports;
pub mod store;
mod supervisor;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use manager::{InstanceManager, ManagerSettings};
pub use ports::{PortAllocator, PortLease};
pub use store::InstanceStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl InstanceStatus {
    /// A process exists (or is about to) for this record.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "crashed" => Some(Self::Crashed),
            _ => None,
        }
    }
}

/// One agent-server process bound to a workspace folder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub folder: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub binary_path: String,
    pub status: InstanceStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Returned to the caller of a successful create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: String,
    pub port: u16,
    pub pid: u32,
    pub binary_path: String,
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("folder not found or not accessible: {0}")]
    FolderNotFound(String),
    #[error("no usable agent-server binary: {0}")]
    BinaryNotFound(String),
    #[error("no free port found after {attempts} attempts")]
    PortExhausted { attempts: u32 },
    #[error("failed to start instance: {0}")]
    SpawnFailed(String),
    #[error("instance '{0}' is already running")]
    AlreadyRunning(String),
}

impl InstanceError {
    /// Stable machine-readable code for transports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::FolderNotFound(_) => "folder_not_found",
            Self::BinaryNotFound(_) => "binary_not_found",
            Self::PortExhausted { .. } => "port_exhausted",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::AlreadyRunning(_) => "already_running",
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            InstanceStatus::Starting,
            InstanceStatus::Running,
            InstanceStatus::Stopping,
            InstanceStatus::Stopped,
            InstanceStatus::Crashed,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::json!(status.as_str()));
        }
        assert!(InstanceStatus::parse("bogus").is_none());
    }

    #[test]
    fn liveness() {
        assert!(InstanceStatus::Stopping.is_live());
        assert!(InstanceStatus::Crashed.is_terminal());
    }

    #[test]
    fn instance_serializes_camel_case() {
        let instance = Instance {
            id: "a".into(),
            folder: "/w".into(),
            port: 41000,
            pid: Some(7),
            binary_path: "/bin/oc".into(),
            status: InstanceStatus::Running,
            created_at: 1,
            updated_at: 2,
            last_error: None,
        };
        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["binaryPath"], "/bin/oc");
        assert_eq!(json["createdAt"], 1);
        assert!(json.get("lastError").is_none());
    }
}
