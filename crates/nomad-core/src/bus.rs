use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use nomad_config::ConfigFile;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Lifecycle, log and config notifications fanned out to every front end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "instance.started", rename_all = "camelCase")]
    InstanceStarted {
        id: String,
        port: u16,
        pid: u32,
        binary_path: String,
    },
    #[serde(rename = "instance.error")]
    InstanceError { id: String, error: String },
    #[serde(rename = "instance.stopped")]
    InstanceStopped { id: String },
    #[serde(rename = "instance.log")]
    InstanceLog { id: String, entry: LogEntry },
    #[serde(rename = "config.appChanged")]
    ConfigChanged { config: ConfigFile },
}

impl Event {
    /// The wire tag, e.g. `instance.started`.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::InstanceStarted { .. } => "instance.started",
            Event::InstanceError { .. } => "instance.error",
            Event::InstanceStopped { .. } => "instance.stopped",
            Event::InstanceLog { .. } => "instance.log",
            Event::ConfigChanged { .. } => "config.appChanged",
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Event::InstanceStarted { id, .. }
            | Event::InstanceError { id, .. }
            | Event::InstanceStopped { id }
            | Event::InstanceLog { id, .. } => Some(id.as_str()),
            Event::ConfigChanged { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Build an entry from one line of child output. A leading level token
    /// (`ERROR`, `[warn]`, `Info:` ...) wins over the stream default.
    pub fn from_line(stream: LogStream, line: &str) -> Self {
        let default = match stream {
            LogStream::Stdout => LogLevel::Info,
            LogStream::Stderr => LogLevel::Warn,
        };
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level: detect_level(line).unwrap_or(default),
            message: line.to_string(),
        }
    }
}

fn detect_level(line: &str) -> Option<LogLevel> {
    let token = line.split_whitespace().next()?;
    let token = token.trim_matches(|c: char| c == '[' || c == ']' || c == ':');
    match token.to_ascii_lowercase().as_str() {
        "error" | "err" | "fatal" => Some(LogLevel::Error),
        "warn" | "warning" => Some(LogLevel::Warn),
        "info" => Some(LogLevel::Info),
        "debug" | "trace" => Some(LogLevel::Debug),
        _ => None,
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<u64, Handler>>,
}

/// In-process publish/subscribe hub.
///
/// `publish` runs every handler inline, in registration order, against a
/// snapshot of the subscriber set. Handlers must not block: transports hand
/// events to their own queue (see [`EventBus::subscribe_channel`]).
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: Event) {
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }

    /// Register a handler. It stays registered until the returned
    /// [`Subscription`] is unsubscribed or dropped.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(handler));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Subscribe with a dedicated unbounded queue, so a slow consumer never
    /// holds up `publish`.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event| {
            // Receiver gone means the consumer is tearing down; its
            // subscription is dropped right after.
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle returned by [`EventBus::subscribe`]. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    active: AtomicBool,
}

impl Subscription {
    /// Idempotent; safe to call from inside a handler.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            inner
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn stopped(id: &str) -> Event {
        Event::InstanceStopped { id: id.into() }
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let mut subs = Vec::new();
        for n in 0..3 {
            let seen = seen.clone();
            subs.push(bus.subscribe(move |_| seen.lock().unwrap().push(n)));
        }
        bus.publish(stopped("a"));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let sub = bus.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(), 0);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn drop_unsubscribes() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe(|_| {});
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_during_dispatch() {
        let bus = EventBus::new();
        let slot: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));
        let hits = Arc::new(AtomicU64::new(0));

        let slot_in = slot.clone();
        let hits_in = hits.clone();
        let sub = bus.subscribe(move |_| {
            hits_in.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = slot_in.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        let later_hits = Arc::new(AtomicU64::new(0));
        let later_in = later_hits.clone();
        let _later = bus.subscribe(move |_| {
            later_in.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(stopped("a"));
        bus.publish(stopped("b"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(later_hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn subscribe_during_dispatch_does_not_deadlock() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        let spawned = Arc::new(StdMutex::new(Vec::new()));
        let spawned_in = spawned.clone();
        let _sub = bus.subscribe(move |_| {
            spawned_in.lock().unwrap().push(inner_bus.subscribe(|_| {}));
        });
        bus.publish(stopped("a"));
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn channel_subscriber_receives_events() {
        let bus = EventBus::new();
        let (sub, mut rx) = bus.subscribe_channel();
        bus.publish(stopped("w1"));
        assert_eq!(rx.recv().await.unwrap(), stopped("w1"));

        drop(sub);
        bus.publish(stopped("w2"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn publish_with_dropped_receiver_is_harmless() {
        let bus = EventBus::new();
        let (_sub, rx) = bus.subscribe_channel();
        drop(rx);
        bus.publish(stopped("a"));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let started = Event::InstanceStarted {
            id: "w1".into(),
            port: 41000,
            pid: 42,
            binary_path: "/bin/opencode".into(),
        };
        let json = serde_json::to_value(&started).unwrap();
        assert_eq!(json["type"], "instance.started");
        assert_eq!(json["binaryPath"], "/bin/opencode");
        assert_eq!(json["port"], 41000);

        let log = Event::InstanceLog {
            id: "w1".into(),
            entry: LogEntry {
                timestamp: 1,
                level: LogLevel::Warn,
                message: "hi".into(),
            },
        };
        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["type"], "instance.log");
        assert_eq!(json["entry"]["level"], "warn");

        let changed = Event::ConfigChanged {
            config: ConfigFile::default(),
        };
        let json = serde_json::to_value(&changed).unwrap();
        assert_eq!(json["type"], "config.appChanged");
        assert!(json["config"]["recentFolders"].is_array());
        assert_eq!(changed.kind(), "config.appChanged");
        assert!(changed.instance_id().is_none());
    }

    #[test]
    fn log_level_detection() {
        let entry = LogEntry::from_line(LogStream::Stdout, "ERROR something broke");
        assert_eq!(entry.level, LogLevel::Error);
        let entry = LogEntry::from_line(LogStream::Stdout, "[warn] disk low");
        assert_eq!(entry.level, LogLevel::Warn);
        let entry = LogEntry::from_line(LogStream::Stderr, "debug: noise");
        assert_eq!(entry.level, LogLevel::Debug);
        let entry = LogEntry::from_line(LogStream::Stderr, "plain stderr");
        assert_eq!(entry.level, LogLevel::Warn);
        let entry = LogEntry::from_line(LogStream::Stdout, "plain stdout");
        assert_eq!(entry.level, LogLevel::Info);
        let entry = LogEntry::from_line(LogStream::Stdout, "");
        assert_eq!(entry.level, LogLevel::Info);
    }
}
