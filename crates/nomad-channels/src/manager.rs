//! Transport manager: coordinates the lifecycle of every enabled front end.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::base::Transport;

/// Starts and stops registered transports together.
#[derive(Default)]
pub struct TransportManager {
    transports: RwLock<BTreeMap<String, Arc<dyn Transport>>>,
}

impl TransportManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport. Must be called before `start_all()`.
    pub async fn register(&self, transport: Arc<dyn Transport>) {
        let name = transport.name().to_string();
        info!("Registered transport: {name}");
        self.transports.write().await.insert(name, transport);
    }

    /// Names of all registered transports.
    pub async fn enabled_transports(&self) -> Vec<String> {
        self.transports.read().await.keys().cloned().collect()
    }

    /// Start every transport in name order. The first failure aborts startup
    /// after stopping those already running.
    pub async fn start_all(&self) -> Result<()> {
        let transports = self.transports.read().await;
        let mut started: Vec<&Arc<dyn Transport>> = Vec::new();
        for (name, transport) in transports.iter() {
            if let Err(e) = transport.start().await {
                warn!("Transport {name} failed to start: {e}");
                for running in started {
                    if let Err(e) = running.stop().await {
                        warn!("Error stopping transport {}: {e}", running.name());
                    }
                }
                return Err(e.context(format!("transport {name} failed to start")));
            }
            info!("Started transport: {name}");
            started.push(transport);
        }
        Ok(())
    }

    /// Stop every transport. Errors are logged, not returned.
    pub async fn stop_all(&self) {
        let transports = self.transports.read().await;
        for (name, transport) in transports.iter() {
            info!("Stopping transport: {name}");
            if let Err(e) = transport.stop().await {
                warn!("Error stopping transport {name}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockTransport {
        name: String,
        fail: bool,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl MockTransport {
        fn new(name: &str, fail: bool) -> Self {
            Self {
                name: name.to_string(),
                fail,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("bind failed");
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn manager_starts_and_stops_all() {
        let manager = TransportManager::new();
        let shell = Arc::new(MockTransport::new("shell", false));
        let web = Arc::new(MockTransport::new("web", false));
        manager.register(shell.clone()).await;
        manager.register(web.clone()).await;
        assert_eq!(manager.enabled_transports().await, vec!["shell", "web"]);

        manager.start_all().await.unwrap();
        assert_eq!(shell.starts(), 1);
        assert_eq!(web.starts(), 1);

        manager.stop_all().await;
        assert_eq!(shell.stops(), 1);
        assert_eq!(web.stops(), 1);
    }

    #[tokio::test]
    async fn failed_start_rolls_back_started_transports() {
        let manager = TransportManager::new();
        let first = Arc::new(MockTransport::new("a", false));
        let broken = Arc::new(MockTransport::new("b", true));
        manager.register(first.clone()).await;
        manager.register(broken.clone()).await;

        let err = manager.start_all().await.unwrap_err();
        assert!(err.to_string().contains("transport b"));
        assert_eq!(first.stops(), 1);
        assert_eq!(broken.stops(), 0);
    }
}
