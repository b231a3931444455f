mod db;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use placelog_common::config::{Config, TimelapseConfig};
use placelog_common::frame::{self, CodecError};
use placelog_core::coalescer::{Coalescer, SubmitError};
use placelog_core::detector::BoundsMismatch;
use placelog_core::diff;
use placelog_core::store::{FrameStore, Order, StoreError};
use placelog_core::timelapse::{self, TimelapseError, TimelapseOptions};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use db::SqliteFrameStore;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    store: Arc<SqliteFrameStore>,
    coalescer: Arc<Coalescer>,
    timelapse: TimelapseConfig,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Bounds(#[from] BoundsMismatch),
    #[error(transparent)]
    Timelapse(#[from] TimelapseError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Bounds(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Timelapse(TimelapseError::NotEnoughFrames { .. }) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

fn join_err(e: tokio::task::JoinError) -> ApiError {
    ApiError::Internal(e.to_string())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/submit/:id — body is a base64-encoded image.
async fn submit(
    State(state): State<Arc<AppState>>,
    AxumPath(place_id): AxumPath<i64>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let data = match base64::engine::general_purpose::STANDARD.decode(body.trim()) {
        Ok(d) => d,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("body is not valid base64: {e}"),
            )
                .into_response();
        }
    };

    let fingerprint = submitter_fingerprint(&headers, addr);
    // Decode plus the registry lookup are synchronous work; keep them off
    // the async handler task like the other store accesses.
    let coalescer = Arc::clone(&state.coalescer);
    let submitted = {
        let fingerprint = fingerprint.clone();
        tokio::task::spawn_blocking(move || coalescer.submit(place_id, &data, &fingerprint)).await
    };
    let submitted = match submitted {
        Ok(r) => r,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    match submitted {
        Ok(()) => {
            info!(place_id, fingerprint, "submission queued");
            StatusCode::ACCEPTED.into_response()
        }
        Err(SubmitError::Blacklisted(_)) => {
            (StatusCode::FORBIDDEN, "blacklisted place").into_response()
        }
        Err(SubmitError::Decode(e)) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Err(SubmitError::Store(e)) => {
            error!(place_id, error = %e, "submission failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /api/img/:id — the stored PNG for one frame.
async fn frame_image(
    State(state): State<Arc<AppState>>,
    AxumPath(sequence_id): AxumPath<i64>,
) -> Result<Response, ApiError> {
    let store = Arc::clone(&state.store);
    let frame = tokio::task::spawn_blocking(move || store.by_id(sequence_id))
        .await
        .map_err(join_err)??;
    Ok(([(header::CONTENT_TYPE, "image/png")], frame.data).into_response())
}

/// GET /api/diff/:id1/:id2 — highlight image of the pixels that changed.
async fn frame_diff(
    State(state): State<Arc<AppState>>,
    AxumPath((id1, id2)): AxumPath<(i64, i64)>,
) -> Result<Response, ApiError> {
    let store = Arc::clone(&state.store);
    let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ApiError> {
        let a = store.by_id(id1)?;
        let b = store.by_id(id2)?;
        let rendered = diff::render_diff(&a.decode()?, &b.decode()?)?;
        Ok(frame::encode_png(&rendered)?)
    })
    .await
    .map_err(join_err)??;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

#[derive(Debug, Deserialize)]
struct TimelapseQuery {
    delay: Option<u16>,
}

/// GET /api/timelapse/:id1/:id2?delay= — animated GIF over the inclusive id
/// range for id1's place.
async fn place_timelapse(
    State(state): State<Arc<AppState>>,
    AxumPath((id1, id2)): AxumPath<(i64, i64)>,
    Query(q): Query<TimelapseQuery>,
) -> Result<Response, ApiError> {
    let mut opts = TimelapseOptions::from_config(&state.timelapse);
    if let Some(delay) = q.delay {
        opts.delay_cs = delay;
    }

    let store = Arc::clone(&state.store);
    let gif = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ApiError> {
        let anchor = store.by_id(id1)?;
        let frames = store.range(anchor.place_id, id1, id2, Order::Ascending)?;
        Ok(timelapse::assemble(&frames, opts)?)
    })
    .await
    .map_err(join_err)??;
    Ok(([(header::CONTENT_TYPE, "image/gif")], gif).into_response())
}

#[derive(Debug, Deserialize)]
struct FramesQuery {
    before: Option<i64>,
    limit: Option<i64>,
}

/// GET /api/places/:id/frames?before=&limit= — newest-first metadata page.
async fn place_frames(
    State(state): State<Arc<AppState>>,
    AxumPath(place_id): AxumPath<i64>,
    Query(q): Query<FramesQuery>,
) -> Result<Response, ApiError> {
    let store = Arc::clone(&state.store);
    let before = q.before.unwrap_or(i64::MAX);
    let limit = q.limit.unwrap_or(50);
    let page = tokio::task::spawn_blocking(move || store.list_page(place_id, before, limit))
        .await
        .map_err(join_err)??;
    Ok(Json(page).into_response())
}

// ---------------------------------------------------------------------------
// Submitter identity
// ---------------------------------------------------------------------------

fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    if let Some(v) = headers.get("cf-connecting-ip").and_then(|v| v.to_str().ok()) {
        return v.to_string();
    }
    // First entry in case the request crossed multiple proxies.
    if let Some(v) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = v.split(',').next() {
            return first.trim().to_string();
        }
    }
    if let Some(v) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return v.to_string();
    }
    addr.ip().to_string()
}

/// Submitters are recorded as a hash of their source address; raw IPs are
/// never persisted.
fn submitter_fingerprint(headers: &HeaderMap, addr: SocketAddr) -> String {
    let ip = client_ip(headers, addr);
    blake3::hash(ip.as_bytes()).to_hex()[..16].to_string()
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        match Config::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config from {}: {e}", config_path.display());
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        port = config.server.port,
        db_path = config.server.db_path,
        cooldown_secs = config.pipeline.cooldown_secs,
        threshold = config.pipeline.dissimilarity_threshold,
        blacklisted = config.pipeline.blacklist.len(),
        "starting placelog server"
    );
    if config.pipeline.blacklist.is_empty() {
        info!("no blacklisted places configured");
    }

    let store = match SqliteFrameStore::open(std::path::Path::new(&config.server.db_path)) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to open frame store");
            std::process::exit(1);
        }
    };

    let coalescer = Coalescer::new(&config.pipeline, store.clone(), store.clone());
    let state = Arc::new(AppState {
        store,
        coalescer,
        timelapse: config.timelapse.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/submit/:id", post(submit))
        .route("/api/img/:id", get(frame_image))
        .route("/api/diff/:id1/:id2", get(frame_diff))
        .route("/api/timelapse/:id1/:id2", get(place_timelapse))
        .route("/api/places/:id/frames", get(place_frames))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    info!(addr, "placelog server listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        });
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
