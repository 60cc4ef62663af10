//! HTTP ingress for the relay.
//!
//! Producers fire payloads at `/` with any method; the whole body is read
//! and appended to the queue. A 204 answer means the payload is durably
//! queued and will be delivered at least once. Enqueue failures surface as
//! a 500 with the error text so the producer can retry.
//!
//! # Endpoints
//!
//! - `ANY /` - Enqueues the request body (returns 204 No Content)
//! - `GET /health` - Returns 200 if the server is running

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use tracing::{debug, error};

use crate::queue::Queue;

/// Shared application state, passed to handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    queue: Arc<Queue>,
}

impl AppState {
    /// Creates a new `AppState` over the queue that ingested payloads are
    /// appended to.
    pub fn new(queue: Arc<Queue>) -> Self {
        AppState { queue }
    }

    /// Returns the queue handle.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", any(ingest_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Accepts a payload and appends it to the queue.
async fn ingest_handler(State(state): State<AppState>, body: Bytes) -> Response {
    match state.queue.put(&body) {
        Ok(()) => {
            debug!(bytes = body.len(), "payload queued");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to enqueue payload");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Liveness probe.
async fn health_handler() -> &'static str {
    "OK"
}
