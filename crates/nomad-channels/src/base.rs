use anyhow::Result;
use async_trait::async_trait;

/// A front-end surface that relays the core to clients.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g. "web", "shell").
    fn name(&self) -> &str;

    /// Begin serving. Returns once the transport is accepting clients.
    async fn start(&self) -> Result<()>;

    /// Release every attached client and stop serving.
    async fn stop(&self) -> Result<()>;
}
