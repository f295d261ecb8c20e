//! Relay between the core and an embedded desktop shell.
//!
//! The shell talks in two directions: it *invokes* named channels
//! (`instance:create`, `config:update`, ...) and receives *notifications*
//! (`instance:started`, `config:appChanged`, `menu:newInstance`, ...). Each
//! attached session owns one bus [`Subscription`] for as long as it lives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use nomad_config::ConfigError;
use nomad_core::{Event, FsError, InstanceError, Subscription};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::AppContext;

/// Native UI the relay cannot provide itself.
#[async_trait]
pub trait ShellHost: Send + Sync {
    /// Ask the user for a folder. `None` when cancelled.
    async fn select_folder(&self) -> Result<Option<String>>;
}

/// Host without any dialog support; every pick is a cancel.
pub struct NoDialogHost;

#[async_trait]
impl ShellHost for NoDialogHost {
    async fn select_folder(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Runs an external picker (`zenity --file-selection --directory`, ...) and
/// takes the first line it prints. A non-zero exit counts as cancel.
pub struct CommandFolderPicker {
    program: String,
    args: Vec<String>,
}

impl CommandFolderPicker {
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ShellHost for CommandFolderPicker {
    async fn select_folder(&self) -> Result<Option<String>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("failed to run folder picker '{}': {e}", self.program))?;

        if !output.status.success() {
            debug!(status = %output.status, "Folder picker cancelled");
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }
}

/// One message pushed to the shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub channel: String,
    pub payload: Value,
}

pub const NEW_INSTANCE_CHANNEL: &str = "menu:newInstance";

impl Notification {
    /// `instance.started` becomes channel `instance:started` with the event
    /// fields as payload.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        let mut payload = serde_json::to_value(event)?;
        if let Value::Object(fields) = &mut payload {
            fields.remove("type");
        }
        Ok(Self {
            channel: event.kind().replace('.', ":"),
            payload,
        })
    }

    pub fn new_instance_request() -> Self {
        Self {
            channel: NEW_INSTANCE_CHANNEL.to_string(),
            payload: Value::Null,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("invalid arguments for {channel}: {message}")]
    InvalidArgs { channel: String, message: String },
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("shell host failed: {0}")]
    Host(String),
    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::UnknownChannel(_) => "unknown_channel",
            RelayError::InvalidArgs { .. } => "invalid_args",
            RelayError::Instance(e) => e.code(),
            RelayError::Config(_) => "validation",
            RelayError::Fs(FsError::NotFound(_)) => "not_found",
            RelayError::Fs(FsError::NotADirectory(_)) => "not_a_directory",
            RelayError::Fs(FsError::Io { .. }) | RelayError::Internal(_) => "internal",
            RelayError::Host(_) => "host_failed",
        }
    }
}

struct SessionSlot {
    tx: mpsc::UnboundedSender<Notification>,
    _subscription: Subscription,
}

/// Invocation/notification relay for embedded shells.
pub struct ShellRelay {
    ctx: AppContext,
    host: Arc<dyn ShellHost>,
    sessions: Arc<DashMap<u64, SessionSlot>>,
    next_id: AtomicU64,
}

/// An attached shell window. Dropping it detaches and unsubscribes.
pub struct ShellSession {
    id: u64,
    rx: mpsc::UnboundedReceiver<Notification>,
    sessions: Arc<DashMap<u64, SessionSlot>>,
}

impl ShellSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next notification, or `None` once detached.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if self.sessions.remove(&self.id).is_some() {
            debug!(session = self.id, "Shell session detached");
        }
    }
}

#[derive(Deserialize)]
struct CreateArgs {
    #[serde(default)]
    id: Option<String>,
    folder: String,
}

#[derive(Deserialize)]
struct StopArgs {
    pid: u32,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    all: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanArgs {
    workspace_folder: String,
}

#[derive(Deserialize)]
struct ListDirectoryArgs {
    #[serde(default)]
    path: Option<String>,
}

impl ShellRelay {
    pub fn new(ctx: AppContext, host: Arc<dyn ShellHost>) -> Self {
        Self {
            ctx,
            host,
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Attach a shell window and start forwarding bus events to it.
    pub fn attach(&self) -> ShellSession {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let forward = tx.clone();
        let subscription = self.ctx.bus.subscribe(move |event| {
            match Notification::from_event(event) {
                Ok(notification) => {
                    let _ = forward.send(notification);
                }
                Err(e) => warn!("Failed to encode {} notification: {e}", event.kind()),
            }
        });
        self.sessions.insert(
            id,
            SessionSlot {
                tx,
                _subscription: subscription,
            },
        );
        debug!(session = id, "Shell session attached");
        ShellSession {
            id,
            rx,
            sessions: Arc::clone(&self.sessions),
        }
    }

    /// Release every session. Their `recv` returns `None` afterwards.
    pub fn detach_all(&self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        if count > 0 {
            info!(count, "Detached shell sessions");
        }
        count
    }

    /// The shell's "New Instance" menu item. Goes to attached sessions only,
    /// never through the bus.
    pub fn request_new_instance(&self) -> usize {
        let mut delivered = 0;
        for slot in self.sessions.iter() {
            if slot.tx.send(Notification::new_instance_request()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Dispatch one invocation. `args` may be positional (`[id, folder]`),
    /// named (`{"folder": ...}`), or a bare value for single-argument channels.
    pub async fn invoke(&self, channel: &str, args: Value) -> Result<Value, RelayError> {
        debug!(channel, "Shell invoke");
        match channel {
            "dialog:selectFolder" => {
                let folder = self
                    .host
                    .select_folder()
                    .await
                    .map_err(|e| RelayError::Host(format!("{e:#}")))?;
                Ok(json!(folder))
            }
            "instance:create" => {
                let request: CreateArgs = parse_args(channel, args, &["id", "folder"])?;
                let id = request.id.filter(|id| !id.is_empty());
                let info = self.ctx.instances.create(id, &request.folder).await?;
                to_json(&info)
            }
            "instance:stop" => {
                let request: StopArgs = parse_args(channel, args, &["pid"])?;
                self.ctx.instances.stop(request.pid).await;
                Ok(Value::Null)
            }
            "instance:list" => {
                let request: ListArgs = parse_args(channel, args, &["all"])?;
                to_json(&self.ctx.instances.list(request.all))
            }
            "fs:scanDirectory" => {
                let request: ScanArgs = parse_args(channel, args, &["workspaceFolder"])?;
                let browser = self.ctx.filesystem.clone();
                let files =
                    tokio::task::spawn_blocking(move || browser.scan(&request.workspace_folder))
                        .await
                        .map_err(|e| RelayError::Internal(format!("scan task failed: {e}")))??;
                to_json(&files)
            }
            "fs:listDirectory" => {
                let request: ListDirectoryArgs = parse_args(channel, args, &["path"])?;
                let path = request
                    .path
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| self.ctx.meta.workspace_root.clone());
                let browser = self.ctx.filesystem.clone();
                let listing = tokio::task::spawn_blocking(move || browser.list_directory(&path))
                    .await
                    .map_err(|e| RelayError::Internal(format!("listing task failed: {e}")))??;
                to_json(&listing)
            }
            "config:get" => to_json(&self.ctx.config.get()),
            "config:update" => {
                let update = match args {
                    Value::Array(mut items) if items.len() == 1 => items.remove(0),
                    other => other,
                };
                to_json(&self.ctx.config.update(update)?)
            }
            "binaries:list" => to_json(&self.ctx.binaries.list()),
            other => Err(RelayError::UnknownChannel(other.to_string())),
        }
    }
}

fn parse_args<T: DeserializeOwned>(
    channel: &str,
    args: Value,
    names: &[&str],
) -> Result<T, RelayError> {
    let named = match args {
        Value::Object(_) => args,
        Value::Null => Value::Object(Map::new()),
        Value::Array(items) => Value::Object(
            names
                .iter()
                .map(|name| name.to_string())
                .zip(items)
                .collect(),
        ),
        single if names.len() == 1 => {
            let mut fields = Map::new();
            fields.insert(names[0].to_string(), single);
            Value::Object(fields)
        }
        _ => {
            return Err(RelayError::InvalidArgs {
                channel: channel.to_string(),
                message: format!("expected {} arguments", names.len()),
            })
        }
    };
    serde_json::from_value(named).map_err(|e| RelayError::InvalidArgs {
        channel: channel.to_string(),
        message: e.to_string(),
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, RelayError> {
    serde_json::to_value(value).map_err(|e| RelayError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use std::time::Duration;
    use tempfile::TempDir;

    struct PickedHost(Option<String>);

    #[async_trait]
    impl ShellHost for PickedHost {
        async fn select_folder(&self) -> Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    fn relay(dir: &TempDir) -> ShellRelay {
        ShellRelay::new(context(dir), Arc::new(NoDialogHost))
    }

    async fn next(session: &mut ShellSession) -> Notification {
        tokio::time::timeout(Duration::from_secs(5), session.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn events_map_to_colon_channels_without_type_tag() {
        let event = Event::InstanceStarted {
            id: "w1".into(),
            port: 41001,
            pid: 7,
            binary_path: "/bin/agent".into(),
        };
        let notification = Notification::from_event(&event).unwrap();
        assert_eq!(notification.channel, "instance:started");
        assert_eq!(
            notification.payload,
            json!({ "id": "w1", "port": 41001, "pid": 7, "binaryPath": "/bin/agent" })
        );
    }

    #[tokio::test]
    async fn session_receives_bus_events_until_dropped() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir);
        let mut session = relay.attach();
        assert_eq!(relay.ctx.bus.subscriber_count(), 1);

        relay
            .invoke("config:update", json!({ "preferences": { "theme": "light" } }))
            .await
            .unwrap();
        let notification = next(&mut session).await;
        assert_eq!(notification.channel, "config:appChanged");
        assert_eq!(notification.payload["config"]["preferences"]["theme"], "light");

        drop(session);
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.ctx.bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn detach_all_ends_every_session() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir);
        let mut a = relay.attach();
        let mut b = relay.attach();
        assert_eq!(relay.detach_all(), 2);
        assert_eq!(relay.ctx.bus.subscriber_count(), 0);
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn new_instance_request_skips_the_bus() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir);
        let mut bus_rx = relay.ctx.bus.subscribe_channel();
        let mut a = relay.attach();
        let mut b = relay.attach();

        assert_eq!(relay.request_new_instance(), 2);
        assert_eq!(next(&mut a).await, Notification::new_instance_request());
        assert_eq!(next(&mut b).await.channel, NEW_INSTANCE_CHANNEL);
        assert!(bus_rx.1.try_recv().is_err());
    }

    #[tokio::test]
    async fn folder_dialog_goes_through_host() {
        let dir = TempDir::new().unwrap();
        let relay = ShellRelay::new(
            context(&dir),
            Arc::new(PickedHost(Some("/home/me/project".into()))),
        );
        let picked = relay.invoke("dialog:selectFolder", Value::Null).await.unwrap();
        assert_eq!(picked, json!("/home/me/project"));

        let cancelled = self::relay(&dir)
            .invoke("dialog:selectFolder", Value::Null)
            .await
            .unwrap();
        assert_eq!(cancelled, Value::Null);
    }

    #[tokio::test]
    async fn invocations_accept_positional_and_named_args() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("ws");
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("docs/readme.md"), "").unwrap();
        let root = root.to_string_lossy().into_owned();
        let relay = relay(&dir);

        let positional = relay
            .invoke("fs:scanDirectory", json!([root.clone()]))
            .await
            .unwrap();
        let bare = relay
            .invoke("fs:scanDirectory", json!(root.clone()))
            .await
            .unwrap();
        let named = relay
            .invoke("fs:scanDirectory", json!({ "workspaceFolder": root }))
            .await
            .unwrap();
        assert_eq!(positional, json!(["docs/readme.md"]));
        assert_eq!(positional, bare);
        assert_eq!(positional, named);

        assert_eq!(
            relay.invoke("instance:stop", json!([424242])).await.unwrap(),
            Value::Null
        );
        assert_eq!(
            relay.invoke("instance:list", Value::Null).await.unwrap(),
            json!([])
        );
    }

    #[tokio::test]
    async fn errors_carry_codes() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir);

        let err = relay.invoke("nope:nothing", Value::Null).await.unwrap_err();
        assert_eq!(err.code(), "unknown_channel");

        let err = relay
            .invoke("instance:create", json!(["w1", "/definitely/not/here"]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "folder_not_found");

        let err = relay
            .invoke("instance:stop", json!({ "pid": "abc" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_args");

        let err = relay
            .invoke("config:update", json!({ "recentFolders": 3 }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");

        let err = relay
            .invoke("fs:listDirectory", json!({ "path": "/definitely/not/here" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_picker_reads_first_line_and_treats_failure_as_cancel() {
        let picker = CommandFolderPicker::new(&[
            "sh".to_string(),
            "-c".to_string(),
            "echo; echo /tmp/picked; echo ignored".to_string(),
        ])
        .unwrap();
        assert_eq!(
            picker.select_folder().await.unwrap().as_deref(),
            Some("/tmp/picked")
        );

        let cancel = CommandFolderPicker::new(&["false".to_string()]).unwrap();
        assert_eq!(cancel.select_folder().await.unwrap(), None);

        assert!(CommandFolderPicker::new(&[]).is_none());
    }
}
