//! HTTP routes.
//!
//! - `GET /{prefix}/{key}.cacnk`: chunk bytes as `application/octet-stream`
//! - `GET /healthz`: liveness
//!
//! Any other path, a key without the chunk suffix, and a chunk no tier has
//! all answer 204. Lookup errors answer 500 with an empty body.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use casnap_store::{ChunkKey, Store};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/{prefix}/{key}", get(get_chunk))
        .fallback(no_content)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "chunk-server",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn get_chunk(
    State(state): State<AppState>,
    Path((_prefix, key)): Path<(String, String)>,
) -> Response {
    let key = ChunkKey::new(key);
    if !key.is_chunk() {
        return StatusCode::NO_CONTENT.into_response();
    }

    let mut buf = Vec::new();
    match state.store.get_chunk(&key, &mut buf).await {
        Ok(()) => ([(header::CONTENT_TYPE, "application/octet-stream")], buf).into_response(),
        Err(e) if e.is_not_found() => {
            debug!(key = %key, "Chunk not found");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            error!(key = %key, error = %e, reason = e.reason_code(), "Chunk lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
