//! Axum router for the meta HTTP API.
//!
//! | Route            | Purpose                                            |
//! |------------------|----------------------------------------------------|
//! | `GET /ping`      | Consensus address of the leader, 503 without one   |
//! | `GET /snapshot`  | Current document; `?index=N` long-polls for change |
//! | `POST /execute`  | Replicate an encoded command                       |
//! | `GET /health`    | Liveness plus index and leader                     |
//! | `GET /metrics`   | Prometheus exposition                              |

use axum::{
    extract::{Query, State},
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::cluster::join::LEADER_HEADER;
use crate::errors::{ConsensusError, MetaError};
use crate::metadata::data::Data;
use crate::metadata::store::Store;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`] serving the meta API.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(handle_ping))
        .route("/snapshot", get(handle_snapshot))
        .route("/execute", post(handle_execute))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outermost so it sees the full request.
        .layer(middleware::from_fn(metrics_middleware))
}

async fn handle_ping(State(state): State<Arc<AppState>>) -> Response {
    match state.store.leader() {
        Some(leader) => (StatusCode::OK, leader).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no leader").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    index: Option<u64>,
}

/// `GET /snapshot[?index=N]`
///
/// With `index`, waits until the document moves past `N` or the long-poll
/// window ends, then returns whatever is current.
async fn handle_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<Data>, MetaError> {
    if let Some(index) = query.index {
        let changed = state.store.after_index(index);
        if !changed.is_signaled() {
            let window = state.config.meta.long_poll_timeout();
            match tokio::time::timeout(window, changed.wait()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => debug!("snapshot long poll at index {} timed out", index),
            }
        }
    }
    Ok(Json(state.store.snapshot()))
}

/// `POST /execute`
///
/// The body is an encoded command.  A not-leader rejection carries the
/// leader's HTTP address in the `x-meta-leader` header when it is known.
async fn handle_execute(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match state.store.apply(&body).await {
        Ok(()) => Json(serde_json::json!({ "index": state.store.index() })).into_response(),
        Err(e) => {
            let leader = leader_http_addr(&state.store, &e);
            let mut response = e.into_response();
            if let Some(value) = leader.and_then(|h| HeaderValue::from_str(&h).ok()) {
                response.headers_mut().insert(LEADER_HEADER, value);
            }
            response
        }
    }
}

/// Resolve the leader named by a not-leader rejection to its HTTP address.
fn leader_http_addr(store: &Store, err: &MetaError) -> Option<String> {
    if !matches!(err, MetaError::Consensus(ConsensusError::NotLeader { .. })) {
        return None;
    }
    let raft_addr = err
        .leader_hint()
        .map(str::to_string)
        .or_else(|| store.leader())?;
    store.meta_node_by_tcp_host(&raft_addr).map(|n| n.host)
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let leader = state.store.leader();
    Json(serde_json::json!({
        "status": if leader.is_some() { "ok" } else { "no_leader" },
        "index": state.store.index(),
        "leader": leader,
    }))
}
