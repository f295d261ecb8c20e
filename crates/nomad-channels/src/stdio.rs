//! Line-delimited JSON framing for [`ShellRelay`], used by `nomad shell`.
//!
//! Host → nomad: `{"id": 1, "channel": "instance:create", "args": [...]}`, or
//! `{"channel": "menu:newInstance"}` with no id for shell-originated
//! notifications. nomad → host: `{"id": 1, "result": ...}`,
//! `{"id": 1, "error": {"message", "code"}}`, or `{"channel", "payload"}`.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::shell::{ShellRelay, NEW_INSTANCE_CHANNEL};

#[derive(Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<Value>,
    channel: String,
    #[serde(default)]
    args: Value,
}

/// Serve one host connection until `reader` hits EOF. In-flight requests are
/// answered before this returns.
pub async fn serve<R, W>(relay: Arc<ShellRelay>, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let write_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if writer.write_all(message.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut session = relay.attach();
    let events_tx = out_tx.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(notification) = session.recv().await {
            match serde_json::to_string(&notification) {
                Ok(line) => {
                    if events_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode {} notification: {e}", notification.channel),
            }
        }
    });

    let mut requests = Vec::new();
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(anyhow::Error::from(e).context("failed to read shell input")),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: Incoming = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed shell message: {e}");
                continue;
            }
        };

        let Some(id) = message.id else {
            if message.channel == NEW_INSTANCE_CHANNEL {
                relay.request_new_instance();
            } else {
                debug!(channel = %message.channel, "Ignoring shell notification");
            }
            continue;
        };

        let relay = Arc::clone(&relay);
        let out_tx = out_tx.clone();
        requests.push(tokio::spawn(async move {
            let response = match relay.invoke(&message.channel, message.args).await {
                Ok(result) => json!({ "id": id, "result": result }),
                Err(e) => json!({
                    "id": id,
                    "error": { "message": e.to_string(), "code": e.code() },
                }),
            };
            let _ = out_tx.send(response.to_string());
        }));
    };

    for request in requests {
        let _ = request.await;
    }
    forward_task.abort();
    let _ = forward_task.await;
    drop(out_tx);
    let _ = write_task.await;

    read_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::shell::NoDialogHost;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    struct Harness {
        _dir: TempDir,
        relay: Arc<ShellRelay>,
        input: WriteHalf<DuplexStream>,
        output: Lines<BufReader<ReadHalf<DuplexStream>>>,
        task: JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start() -> Self {
            let dir = TempDir::new().unwrap();
            let relay = Arc::new(ShellRelay::new(context(&dir), Arc::new(NoDialogHost)));
            let (client, server) = tokio::io::duplex(64 * 1024);
            let (server_read, server_write) = tokio::io::split(server);
            let task = tokio::spawn(serve(Arc::clone(&relay), server_read, server_write));
            let (client_read, input) = tokio::io::split(client);
            Self {
                _dir: dir,
                relay,
                input,
                output: BufReader::new(client_read).lines(),
                task,
            }
        }

        async fn send(&mut self, line: &str) {
            self.input.write_all(line.as_bytes()).await.unwrap();
            self.input.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn answers_requests_by_id() {
        let mut h = Harness::start();
        h.send(r#"{"id": 1, "channel": "config:get"}"#).await;
        let response = h.recv().await;
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["preferences"]["theme"], "system");

        h.send(r#"{"id": "abc", "channel": "no:such"}"#).await;
        let response = h.recv().await;
        assert_eq!(response["id"], "abc");
        assert_eq!(response["error"]["code"], "unknown_channel");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let mut h = Harness::start();
        h.send("not json").await;
        h.send("").await;
        h.send(r#"{"id": 2, "channel": "instance:list"}"#).await;
        let response = h.recv().await;
        assert_eq!(response, json!({ "id": 2, "result": [] }));
    }

    #[tokio::test]
    async fn forwards_bus_events_and_menu_requests() {
        let mut h = Harness::start();
        h.send(r#"{"id": 3, "channel": "config:update", "args": [{"preferences": {"theme": "dark"}}]}"#)
            .await;
        let first = h.recv().await;
        let second = h.recv().await;
        let (response, notification) = if first.get("id").is_some() {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(response["result"]["preferences"]["theme"], "dark");
        assert_eq!(notification["channel"], "config:appChanged");
        assert_eq!(notification["payload"]["config"]["preferences"]["theme"], "dark");

        h.send(r#"{"channel": "menu:newInstance"}"#).await;
        assert_eq!(
            h.recv().await,
            json!({ "channel": "menu:newInstance", "payload": null })
        );
    }

    #[tokio::test]
    async fn eof_detaches_the_session() {
        let mut h = Harness::start();
        h.send(r#"{"id": 4, "channel": "binaries:list"}"#).await;
        assert_eq!(h.recv().await["result"], json!([]));
        assert_eq!(h.relay.session_count(), 1);

        h.input.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), &mut h.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(h.relay.session_count(), 0);
    }
}
