//! The agent's single logical route.
//!
//! - `POST /` - `{"key": token}` → `{"master_key": base64}` or `{"error": ...}`
//! - `GET /` - usage hint, never the secret

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, DefaultBodyLimit, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;

use super::AgentState;
use crate::relay::protocol::{
    RelayRequest, RelayResponse, ERR_INVALID_JSON, ERR_INVALID_TOKEN, ERR_USAGE,
};

/// Largest accepted query body.
const MAX_BODY_BYTES: usize = 16 * 1024;

pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/", get(usage).post(query))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn usage() -> Json<RelayResponse> {
    Json(RelayResponse::error(ERR_USAGE))
}

/// Every reply carries a JSON body. Status codes are 200 for the key, 400
/// for an unusable body (413 when over the limit) and 401 for a wrong token.
/// Clients read the body and do not depend on the status.
async fn query(
    State(state): State<Arc<AgentState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Bytes, BytesRejection>,
) -> (StatusCode, Json<RelayResponse>) {
    tracing::info!("Connection from {}", peer.ip());

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!("Rejected query from {}: {}", peer.ip(), rejection);
            return (rejection.status(), Json(RelayResponse::error(ERR_INVALID_JSON)));
        }
    };

    let request: RelayRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Rejected query from {}: body is not a key request ({})", peer.ip(), e);
            return (
                StatusCode::BAD_REQUEST,
                Json(RelayResponse::error(ERR_INVALID_JSON)),
            );
        }
    };

    if state.agent_token.matches(&request.key) {
        tracing::info!("Correct agent token from {}, returning master key", peer.ip());
        (
            StatusCode::OK,
            Json(RelayResponse::master_key(&state.master_key)),
        )
    } else {
        tracing::warn!("Invalid agent token from {}", peer.ip());
        (
            StatusCode::UNAUTHORIZED,
            Json(RelayResponse::error(ERR_INVALID_TOKEN)),
        )
    }
}
