pub mod base;
pub mod context;
pub mod manager;
pub mod shell;
pub mod stdio;
pub mod web;

pub use base::Transport;
pub use context::{AppContext, ServerMeta};
pub use manager::TransportManager;
pub use shell::{
    CommandFolderPicker, NoDialogHost, Notification, RelayError, ShellHost, ShellRelay,
    ShellSession,
};
pub use web::{ApiError, SseRegistry, WebTransport};
