use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::item::WorkKind;
use crate::leader::{LeaderLock, Leadership};
use crate::lease::LeaseManager;
use crate::view::QueueDepth;

#[derive(Clone)]
pub struct DashboardState {
    pub leadership: Leadership,
    pub lock: LeaderLock,
    pub lease_manager: LeaseManager,
}

#[derive(Serialize)]
struct LeaderStatusResponse {
    holder_id: String,
    is_leader: bool,
    current_leader: Option<String>,
    lock_store_reachable: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Read-only monitoring routes.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/leader", get(leader_status_handler))
        .route("/api/queues", get(all_depths_handler))
        .route("/api/queues/:kind", get(queue_depth_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn leader_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let (current_leader, reachable) = match state.lock.holder().await {
        Ok(token) => (token.map(|t| t.holder_id), true),
        Err(e) => {
            tracing::debug!(error = %e, "Leader lookup failed");
            (None, false)
        }
    };

    Json(LeaderStatusResponse {
        holder_id: state.lock.holder_id().to_string(),
        is_leader: state.leadership.is_leader(),
        current_leader,
        lock_store_reachable: reachable,
    })
}

async fn all_depths_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let mut depths: Vec<QueueDepth> = Vec::with_capacity(WorkKind::ALL.len());
    for kind in WorkKind::ALL {
        match state.lease_manager.queue_depth(kind).await {
            Ok(depth) => depths.push(depth),
            Err(e) => {
                return error_response(StatusCode::SERVICE_UNAVAILABLE, e).into_response();
            }
        }
    }
    Json(depths).into_response()
}

async fn queue_depth_handler(
    State(state): State<DashboardState>,
    Path(kind): Path<String>,
) -> impl IntoResponse {
    let kind: WorkKind = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e).into_response(),
    };

    match state.lease_manager.queue_depth(kind).await {
        Ok(depth) => Json(depth).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e).into_response(),
    }
}
