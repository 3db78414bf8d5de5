use crate::bridge::FrameBridge;
use crate::config::{OutputMode, PpecamConfig, SourceKind};
use crate::error::{PpecamError, Result};
use crate::push::MultipartEncoder;
use crate::status::{StatusSnapshot, SystemStatus};
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, trace};

/// HTTP delivery server.
///
/// In push mode `/stream` fans the bridge's frames out to any number of
/// connected clients, each reading from its own bounded broadcast queue. In
/// segmented mode the same path space serves the playlist and segment files
/// directly. `/health` always reflects the current status registry.
pub struct StreamServer {
    ip: String,
    port: u16,
    mode: OutputMode,
    source_kind: SourceKind,
    output_dir: String,
    content_type: String,
    queue_depth: usize,
    bridge: Arc<FrameBridge>,
    status: Arc<SystemStatus>,
}

#[derive(Clone)]
struct ServerState {
    frames: broadcast::Sender<Bytes>,
    status: Arc<SystemStatus>,
    content_type: String,
    mode: OutputMode,
    source_kind: SourceKind,
}

impl StreamServer {
    pub fn new(config: &PpecamConfig, bridge: Arc<FrameBridge>, status: Arc<SystemStatus>) -> Self {
        let encoder = MultipartEncoder::new(&config.output.boundary, config.output.jpeg_quality);
        Self {
            ip: config.server.ip.clone(),
            port: config.server.port,
            mode: config.output.mode,
            source_kind: config.source.kind,
            output_dir: config.output.output_dir.clone(),
            content_type: encoder.content_type(),
            queue_depth: config.output.max_queue_depth,
            bridge,
            status,
        }
    }

    /// Bind and serve until the token is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let (frames_tx, _) = broadcast::channel(self.queue_depth);

        // Pump frames from the capture bridge into the broadcast channel.
        // The server's scheduler owns all fan-out; the pipeline stays
        // unaware of client count.
        if self.mode == OutputMode::Push {
            let bridge = Arc::clone(&self.bridge);
            let tx = frames_tx.clone();
            let pump_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut last_seq = 0u64;
                loop {
                    tokio::select! {
                        _ = pump_shutdown.cancelled() => break,
                        (seq, bytes) = bridge.next_after(last_seq) => {
                            last_seq = seq;
                            // No receivers means no connected clients;
                            // the frame is simply dropped.
                            let _ = tx.send(bytes);
                        }
                    }
                }
            });
        }

        let state = ServerState {
            frames: frames_tx,
            status: Arc::clone(&self.status),
            content_type: self.content_type.clone(),
            mode: self.mode,
            source_kind: self.source_kind,
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any);

        let router = Router::new()
            .route("/stream", get(stream_handler))
            .route("/health", get(health_handler));
        let router = match self.mode {
            OutputMode::Push => router.with_state(state),
            OutputMode::Segmented => router
                .fallback_service(ServeDir::new(&self.output_dir))
                .with_state(state),
        };
        let router = router.layer(cors);

        let addr = format!("{}:{}", self.ip, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| PpecamError::server(format!("failed to bind {}: {}", addr, e)))?;

        info!(mode = %self.mode, "HTTP server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| PpecamError::server(format!("server error: {}", e)))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

/// Decrements the active-client count when a stream client goes away, on
/// every disconnect path.
struct ClientGuard {
    status: Arc<SystemStatus>,
}

impl ClientGuard {
    fn register(status: Arc<SystemStatus>) -> Self {
        let active = status.client_connected();
        info!(active, "stream client connected");
        Self { status }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let active = self.status.client_disconnected();
        info!(active, "stream client disconnected");
    }
}

/// Continuous multipart stream of boundary-delimited JPEG frames,
/// terminated only by client disconnect.
async fn stream_handler(State(state): State<ServerState>) -> Response {
    if state.mode != OutputMode::Push {
        return Json(serde_json::json!({ "error": "push mode not enabled" })).into_response();
    }

    let guard = ClientGuard::register(Arc::clone(&state.status));
    let mut rx = state.frames.subscribe();

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            match rx.recv().await {
                Ok(bytes) => yield Ok::<Bytes, Infallible>(bytes),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Skip straight to the newest frame
                    trace!(skipped, "stream client lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, state.content_type.clone())
        .header(header::CACHE_CONTROL, "no-cache, private")
        .header(header::PRAGMA, "no-cache")
        .header(header::CONNECTION, "close")
        .body(axum::body::Body::from_stream(stream))
        .unwrap()
}

/// JSON status snapshot, always current truth.
async fn health_handler(State(state): State<ServerState>) -> Json<StatusSnapshot> {
    Json(state.status.snapshot(state.mode, state.source_kind))
}
