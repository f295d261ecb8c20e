use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::manager::LiveMap;
use super::ports::PortLease;
use super::store::InstanceStore;
use super::InstanceStatus;
use crate::bus::{Event, EventBus, LogEntry, LogStream};

/// How long to keep reading buffered output once the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Pre-ready lines kept for replay; older ones are dropped first.
const MAX_PENDING_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
}

struct RunState {
    phase: Phase,
    pending: VecDeque<LogEntry>,
    stop_requested: bool,
    kill_at: Option<Instant>,
    /// Set when the readiness deadline passed and the child was killed.
    failure: Option<String>,
    exited: bool,
}

/// Owns one child process from spawn to exit.
pub(super) struct Supervisor {
    pub id: String,
    pub port: u16,
    pub pid: u32,
    pub binary_path: String,
    pub child: Child,
    pub lease: PortLease,
    pub store: Arc<InstanceStore>,
    pub bus: EventBus,
    pub live: LiveMap,
    pub stop_rx: mpsc::UnboundedReceiver<()>,
    pub exit_tx: watch::Sender<bool>,
    pub ready_tx: Option<oneshot::Sender<Result<(), String>>>,
    pub ready_pattern: Regex,
    pub ready_timeout: Duration,
    pub stop_grace: Duration,
}

impl Supervisor {
    pub async fn run(mut self) {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut pumps = Vec::new();
        if let Some(out) = self.child.stdout.take() {
            pumps.push(tokio::spawn(pump_lines(out, LogStream::Stdout, line_tx.clone())));
        }
        if let Some(err) = self.child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(err, LogStream::Stderr, line_tx.clone())));
        }
        drop(line_tx);

        let ready_at = Instant::now() + self.ready_timeout;
        let mut state = RunState {
            phase: Phase::Starting,
            pending: VecDeque::new(),
            stop_requested: false,
            kill_at: None,
            failure: None,
            exited: false,
        };
        let mut lines_open = true;

        let exit = loop {
            let awaiting_ready = state.phase == Phase::Starting
                && state.failure.is_none()
                && !state.stop_requested;
            let kill_at = state.kill_at;

            tokio::select! {
                status = self.child.wait() => break status,
                line = line_rx.recv(), if lines_open => match line {
                    Some((stream, text)) => self.on_line(&mut state, stream, &text),
                    None => lines_open = false,
                },
                _ = self.stop_rx.recv(), if !state.stop_requested => self.begin_stop(&mut state),
                _ = sleep_until(ready_at), if awaiting_ready => {
                    let reason = format!("not ready within {:?}", self.ready_timeout);
                    warn!(id = %self.id, "Instance {reason}, killing");
                    state.failure = Some(reason);
                    if let Err(e) = self.child.start_kill() {
                        warn!(id = %self.id, "Failed to kill instance: {e}");
                    }
                }
                _ = sleep_until(kill_at.unwrap_or(ready_at)), if kill_at.is_some() => {
                    warn!(id = %self.id, pid = self.pid, "Instance ignored termination, killing");
                    state.kill_at = None;
                    if let Err(e) = self.child.start_kill() {
                        warn!(id = %self.id, "Failed to kill instance: {e}");
                    }
                }
            }
        };

        state.exited = true;
        let drain_until = Instant::now() + DRAIN_TIMEOUT;
        while lines_open {
            match timeout_at(drain_until, line_rx.recv()).await {
                Ok(Some((stream, text))) => self.on_line(&mut state, stream, &text),
                Ok(None) | Err(_) => break,
            }
        }
        for pump in pumps {
            pump.abort();
        }

        self.finish(state, exit);
    }

    fn on_line(&mut self, state: &mut RunState, stream: LogStream, text: &str) {
        let entry = LogEntry::from_line(stream, text);
        if state.phase == Phase::Running {
            self.publish_log(entry);
            return;
        }
        let ready = !state.exited
            && !state.stop_requested
            && state.failure.is_none()
            && self.ready_pattern.is_match(text);
        push_capped(&mut state.pending, entry, MAX_PENDING_LINES);
        if ready {
            self.mark_running(state);
        }
    }

    fn mark_running(&mut self, state: &mut RunState) {
        state.phase = Phase::Running;
        self.store.set_status(&self.id, InstanceStatus::Running);
        info!(id = %self.id, port = self.port, pid = self.pid, "Instance running");
        self.bus.publish(Event::InstanceStarted {
            id: self.id.clone(),
            port: self.port,
            pid: self.pid,
            binary_path: self.binary_path.clone(),
        });
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(Ok(()));
        }
        for entry in std::mem::take(&mut state.pending) {
            self.publish_log(entry);
        }
    }

    fn begin_stop(&mut self, state: &mut RunState) {
        state.stop_requested = true;
        state.kill_at = Some(Instant::now() + self.stop_grace);
        self.store.set_status(&self.id, InstanceStatus::Stopping);
        info!(id = %self.id, pid = self.pid, "Stopping instance");
        self.terminate();
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            match i32::try_from(pid) {
                Ok(raw) => match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    Ok(()) => return,
                    Err(e) => warn!(id = %self.id, "SIGTERM failed, killing: {e}"),
                },
                Err(_) => warn!(id = %self.id, pid, "Pid out of range, killing"),
            }
        }
        if let Err(e) = self.child.start_kill() {
            debug!(id = %self.id, "Kill after exit: {e}");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(id = %self.id, "Kill after exit: {e}");
        }
    }

    fn publish_log(&self, entry: LogEntry) {
        self.bus.publish(Event::InstanceLog {
            id: self.id.clone(),
            entry,
        });
    }

    fn finish(mut self, mut state: RunState, exit: std::io::Result<ExitStatus>) {
        let outcome = match &exit {
            Ok(status) => describe_exit(*status),
            Err(e) => format!("could not be waited on: {e}"),
        };

        let error = if state.stop_requested {
            None
        } else if state.phase == Phase::Running {
            Some(format!("process {outcome}"))
        } else {
            let mut reason = state
                .failure
                .take()
                .unwrap_or_else(|| format!("process {outcome} before becoming ready"));
            if let Some(last) = state.pending.iter().rev().find(|e| !e.message.trim().is_empty()) {
                reason.push_str(": ");
                reason.push_str(last.message.trim());
            }
            Some(reason)
        };

        match &error {
            None => info!(id = %self.id, "Instance stopped ({outcome})"),
            Some(reason) => warn!(id = %self.id, "Instance crashed: {reason}"),
        }
        if state.phase == Phase::Starting {
            for entry in &state.pending {
                debug!(id = %self.id, "pre-ready output: {}", entry.message);
            }
        }

        let status = if error.is_some() {
            InstanceStatus::Crashed
        } else {
            InstanceStatus::Stopped
        };
        self.store.finish(&self.id, status, error.clone());

        // The child is gone, so its port may be handed out again.
        drop(self.lease);
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.id);

        if let Some(reason) = &error {
            self.bus.publish(Event::InstanceError {
                id: self.id.clone(),
                error: reason.clone(),
            });
        }
        self.bus.publish(Event::InstanceStopped {
            id: self.id.clone(),
        });
        let _ = self.exit_tx.send(true);

        if let Some(tx) = self.ready_tx.take() {
            let reason = error.unwrap_or_else(|| "stopped before becoming ready".to_string());
            let _ = tx.send(Err(reason));
        }
    }
}

/// Forward child output line by line. Bytes that are not UTF-8 are replaced
/// rather than ending the pump, so the child never loses its pipe.
async fn pump_lines<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<(LogStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading {stream:?}: {e}");
                break;
            }
        }
    }
}

fn push_capped(pending: &mut VecDeque<LogEntry>, entry: LogEntry, cap: usize) {
    while pending.len() >= cap.max(1) {
        pending.pop_front();
    }
    pending.push_back(entry);
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {signal}");
        }
    }
    "exited".to_string()
}
