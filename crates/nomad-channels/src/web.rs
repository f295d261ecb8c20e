use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use nomad_config::{BinaryDescriptor, ConfigError, ConfigFile};
use nomad_core::{
    DirectoryListing, FsError, Instance, InstanceError, InstanceInfo, RegistryError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::base::Transport;
use crate::context::{AppContext, ServerMeta};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP API plus the `/api/events` SSE relay.
pub struct WebTransport {
    host: String,
    port: u16,
    ctx: AppContext,
    sse: SseRegistry,
    bound: Arc<OnceLock<SocketAddr>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
struct AppState {
    ctx: AppContext,
    sse: SseRegistry,
    bound: Arc<OnceLock<SocketAddr>>,
}

impl WebTransport {
    pub fn new(host: impl Into<String>, port: u16, ctx: AppContext) -> Self {
        Self {
            host: host.into(),
            port,
            ctx,
            sse: SseRegistry::default(),
            bound: Arc::new(OnceLock::new()),
            shutdown_tx: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    pub fn sse(&self) -> &SseRegistry {
        &self.sse
    }
}

#[async_trait]
impl Transport for WebTransport {
    fn name(&self) -> &str {
        "web"
    }

    async fn start(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {}:{}: {e}", self.host, self.port))?;
        let addr = listener.local_addr()?;
        let _ = self.bound.set(addr);
        info!("Web transport listening on http://{addr}");

        let router = build_router(AppState {
            ctx: self.ctx.clone(),
            sse: self.sse.clone(),
            bound: Arc::clone(&self.bound),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let sse = self.sse.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });

            if let Err(e) = server.await {
                error!("Web server error: {e}");
            }

            // Release any stream that attached during shutdown
            sse.close_all();
        });
        *self.server.lock().await = Some(handle);

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Streams never finish on their own, so graceful shutdown needs them gone first.
        let closed = self.sse.close_all();
        if closed > 0 {
            info!(count = closed, "Closed SSE clients");
        }
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("Web server did not shut down within {SHUTDOWN_TIMEOUT:?}");
            }
        }
        Ok(())
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/workspaces", get(list_workspaces).post(create_workspace))
        .route("/api/workspaces/stop", post(stop_workspace))
        .route(
            "/api/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route(
            "/api/config/app",
            get(get_app_config)
                .patch(update_app_config)
                .put(update_app_config),
        )
        .route(
            "/api/config/binaries",
            get(list_binaries).post(add_binary).delete(remove_binary),
        )
        .route("/api/config/binaries/default", put(set_default_binary))
        .route("/api/filesystem", get(list_directory))
        .route("/api/filesystem/scan", post(scan_directory))
        .route("/api/meta", get(server_meta))
        .route("/api/events", get(events))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Instance(e) => match e {
                InstanceError::FolderNotFound(_) => StatusCode::BAD_REQUEST,
                InstanceError::AlreadyRunning(_) => StatusCode::CONFLICT,
                InstanceError::BinaryNotFound(_) | InstanceError::PortExhausted { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                InstanceError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Config(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(e) => match e {
                RegistryError::NotRegistered(_) => StatusCode::NOT_FOUND,
                RegistryError::NotFound(_) | RegistryError::Config(_) => StatusCode::BAD_REQUEST,
            },
            ApiError::Fs(e) => match e {
                FsError::NotFound(_) => StatusCode::NOT_FOUND,
                FsError::NotADirectory(_) => StatusCode::BAD_REQUEST,
                FsError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Instance(e) => e.code(),
            ApiError::Config(_) | ApiError::Registry(RegistryError::Config(_)) => "validation",
            ApiError::Registry(RegistryError::NotFound(_)) => "binary_not_found",
            ApiError::Registry(RegistryError::NotRegistered(_)) => "binary_not_registered",
            ApiError::Fs(FsError::NotFound(_)) | ApiError::NotFound(_) => "not_found",
            ApiError::Fs(FsError::NotADirectory(_)) => "not_a_directory",
            ApiError::Fs(FsError::Io { .. }) | ApiError::Internal(_) => "internal",
            ApiError::Unavailable(_) => "unavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.code(), "Request failed: {self}");
        }
        let body = json!({ "error": self.to_string(), "code": self.code() });
        (status, Json(body)).into_response()
    }
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    ApiError::Internal(format!("background task failed: {e}"))
}

// ---------------------------------------------------------------------------
// Workspaces

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    all: bool,
}

async fn list_workspaces(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<Instance>> {
    Json(state.ctx.instances.list(query.all))
}

#[derive(Deserialize)]
struct CreateRequest {
    #[serde(default)]
    id: Option<String>,
    folder: String,
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<InstanceInfo>), ApiError> {
    let info = state
        .ctx
        .instances
        .create(request.id, &request.folder)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[derive(Deserialize)]
struct StopRequest {
    pid: u32,
}

async fn stop_workspace(
    State(state): State<AppState>,
    Json(request): Json<StopRequest>,
) -> StatusCode {
    state.ctx.instances.stop(request.pid).await;
    StatusCode::NO_CONTENT
}

async fn get_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    state
        .ctx
        .instances
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown instance '{id}'")))
}

async fn delete_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let record = state
        .ctx
        .instances
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown instance '{id}'")))?;
    if let (true, Some(pid)) = (record.status.is_live(), record.pid) {
        state.ctx.instances.stop(pid).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Config

async fn get_app_config(State(state): State<AppState>) -> Json<ConfigFile> {
    Json(state.ctx.config.get())
}

async fn update_app_config(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ConfigFile>, ApiError> {
    Ok(Json(state.ctx.config.update(body)?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BinaryListing {
    binaries: Vec<BinaryDescriptor>,
    preferred: Option<String>,
    /// Executable a create would launch right now.
    resolved: Option<String>,
}

async fn list_binaries(State(state): State<AppState>) -> Json<BinaryListing> {
    let binaries = &state.ctx.binaries;
    Json(BinaryListing {
        binaries: binaries.list(),
        preferred: binaries.preferred(),
        resolved: binaries
            .resolve()
            .map(|b| b.path.to_string_lossy().into_owned()),
    })
}

#[derive(Deserialize)]
struct AddBinaryRequest {
    path: String,
    #[serde(default)]
    label: Option<String>,
}

async fn add_binary(
    State(state): State<AppState>,
    Json(request): Json<AddBinaryRequest>,
) -> Result<(StatusCode, Json<BinaryDescriptor>), ApiError> {
    let added = state
        .ctx
        .binaries
        .add(&request.path, request.label)
        .await?;
    Ok((StatusCode::CREATED, Json(added)))
}

#[derive(Deserialize)]
struct BinaryPath {
    path: String,
}

async fn remove_binary(
    State(state): State<AppState>,
    Query(query): Query<BinaryPath>,
) -> Result<StatusCode, ApiError> {
    if state.ctx.binaries.remove(&query.path)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "binary is not registered: {}",
            query.path
        )))
    }
}

async fn set_default_binary(
    State(state): State<AppState>,
    Json(request): Json<BinaryPath>,
) -> Result<Json<ConfigFile>, ApiError> {
    Ok(Json(state.ctx.binaries.set_default(&request.path)?))
}

// ---------------------------------------------------------------------------
// Filesystem and meta

#[derive(Deserialize)]
struct DirectoryQuery {
    #[serde(default)]
    path: Option<String>,
}

async fn list_directory(
    State(state): State<AppState>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<DirectoryListing>, ApiError> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| state.ctx.meta.workspace_root.clone());
    let browser = state.ctx.filesystem.clone();
    let listing = tokio::task::spawn_blocking(move || browser.list_directory(&path))
        .await
        .map_err(join_error)??;
    Ok(Json(listing))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanRequest {
    workspace_folder: String,
}

async fn scan_directory(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<Vec<String>>, ApiError> {
    let browser = state.ctx.filesystem.clone();
    let files = tokio::task::spawn_blocking(move || browser.scan(&request.workspace_folder))
        .await
        .map_err(join_error)??;
    Ok(Json(files))
}

async fn server_meta(State(state): State<AppState>) -> Json<ServerMeta> {
    let mut meta = state.ctx.meta.clone();
    if let Some(addr) = state.bound.get() {
        meta.port = addr.port();
    }
    Json(meta)
}

// ---------------------------------------------------------------------------
// SSE

/// Every attached event stream, so shutdown can release them all.
#[derive(Clone, Default)]
pub struct SseRegistry {
    inner: Arc<SseInner>,
}

#[derive(Default)]
struct SseInner {
    next_id: AtomicU64,
    clients: DashMap<u64, oneshot::Sender<()>>,
    closed: AtomicBool,
}

/// Registry slot held by one stream. Resolves `closed` when released.
struct SseClient {
    id: u64,
    registry: SseRegistry,
    closed: oneshot::Receiver<()>,
}

impl SseClient {
    async fn closed(mut self) {
        let _ = (&mut self.closed).await;
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.registry.inner.clients.remove(&self.id);
    }
}

impl SseRegistry {
    fn register(&self) -> Option<SseClient> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.clients.insert(id, tx);
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.clients.remove(&id);
            return None;
        }
        Some(SseClient {
            id,
            registry: self.clone(),
            closed: rx,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    /// Release every attached stream and refuse new ones. Returns how many
    /// streams were released.
    pub fn close_all(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.inner.clients.iter().map(|entry| *entry.key()).collect();
        let mut released = 0;
        for id in ids {
            if let Some((_, tx)) = self.inner.clients.remove(&id) {
                let _ = tx.send(());
                released += 1;
            }
        }
        released
    }
}

async fn events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let client = state
        .sse
        .register()
        .ok_or_else(|| ApiError::Unavailable("server is shutting down".into()))?;
    let (subscription, rx) = state.ctx.bus.subscribe_channel();
    let client_id = client.id;
    debug!(client = client_id, "SSE client attached");

    // Dropping this future (client gone or stream released) drops the subscription.
    let released = async move {
        client.closed().await;
        drop(subscription);
        debug!(client = client_id, "SSE client released");
    };

    let stream = UnboundedReceiverStream::new(rx)
        .filter_map(|event| async move {
            match SseEvent::default().json_data(&event) {
                Ok(frame) => Some(Ok::<_, Infallible>(frame)),
                Err(e) => {
                    warn!("Failed to encode {} event: {e}", event.kind());
                    None
                }
            }
        })
        .take_until(released);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
