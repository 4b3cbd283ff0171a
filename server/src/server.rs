use std::convert::Infallible;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use frame_relay_common::config::Config;
use frame_relay_common::multipart;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::annotate::{self, AnnotateError, Annotator};
use crate::ingest::{IngestMessage, IngestSession};
use crate::store::FrameStore;
use crate::stream::{StreamSession, StreamSettings};
use crate::validator::FrameValidator;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid annotator config: {0}")]
    Annotate(#[from] AnnotateError),
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    store: Arc<FrameStore>,
    validator: FrameValidator,
    annotator: Option<Arc<dyn Annotator>>,
    stream: StreamSettings,
    shutdown: CancellationToken,
    next_session_id: AtomicU64,
}

impl AppState {
    pub fn new(
        store: Arc<FrameStore>,
        validator: FrameValidator,
        annotator: Option<Arc<dyn Annotator>>,
        stream: StreamSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            validator,
            annotator,
            stream,
            shutdown,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Build the state described by `config`, loading the placeholder once.
    pub fn from_config(config: &Config, shutdown: CancellationToken) -> Result<Self, ServerError> {
        let store = Arc::new(FrameStore::with_placeholder_path(Path::new(
            &config.server.placeholder_path,
        )));
        let annotator = annotate::from_config(&config.annotate)?;
        Ok(Self::new(
            store,
            FrameValidator::new(config.ingest.min_frame_bytes),
            annotator,
            StreamSettings::from(&config.stream),
            shutdown,
        ))
    }

    fn session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET / and GET /stream: endless multipart/x-mixed-replace JPEG stream
async fn stream_frames(State(state): State<Arc<AppState>>) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(1);
    let session = StreamSession::new(
        state.session_id(),
        Arc::clone(&state.store),
        state.annotator.clone(),
        state.stream,
        state.shutdown.clone(),
    );
    tokio::spawn(session.run(tx));

    // When the viewer hangs up, hyper drops the body and with it `rx`,
    // which ends the session on its next send.
    let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });

    (
        [
            (header::CONTENT_TYPE, multipart::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        Body::from_stream(chunks),
    )
        .into_response()
}

/// GET /ws: WebSocket upgrade for the producing device
async fn ingest_frames(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let session = IngestSession::new(
            state.session_id(),
            Arc::clone(&state.store),
            state.validator,
            state.shutdown.clone(),
        );
        session.run(socket.map(|message| message.map(IngestMessage::from))).await;
    })
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    current_seq: Option<u64>,
    has_placeholder: bool,
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(Health {
        status: "ok",
        current_seq: state.store.current().map(|frame| frame.seq),
        has_placeholder: state.store.has_placeholder(),
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(stream_frames))
        .route("/stream", get(stream_frames))
        .route("/ws", get(ingest_frames))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Serve
// ---------------------------------------------------------------------------

/// Bind and serve until ctrl-c. On shutdown every open ingest and stream
/// session is cancelled so the graceful drain does not wait on endless
/// multipart responses.
pub async fn serve(config: &Config) -> Result<(), ServerError> {
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::from_config(config, shutdown.clone())?);

    let addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Bind(addr.clone(), e))?;
    info!(
        addr,
        min_frame_bytes = config.ingest.min_frame_bytes,
        pacing_ms = config.stream.pacing_interval_ms,
        annotate = config.annotate.kind,
        "frame-relay server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested, closing sessions");
            shutdown.cancel();
        })
        .await
        .map_err(ServerError::Serve)
}
