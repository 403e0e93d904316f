//! HTTP surface of the manager
//!
//! - `GET {register_path}`: tunnel registration (agents and peers)
//! - `{k8s_prefix}/clusters/{id}/...`: kube-apiserver proxy
//! - `{mesos_prefix}/...`: mesos-driver proxy
//! - `GET /healthz`, `GET /readyz`
//! - `GET /statusz`: connected clusters and proxy totals as JSON

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::metrics::MetricsSnapshot;
use crate::state::ManagerState;

/// Build the manager's router
pub fn build_router(state: Arc<ManagerState>) -> Router {
    let server = Arc::clone(&state.server);
    let register = get(move |request: Request| {
        let server = Arc::clone(&server);
        async move { server.accept(request).await }
    });

    Router::new()
        .route(&state.config.register_path, register)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/statusz", get(statusz))
        .with_state(Arc::clone(&state))
        .merge(Arc::clone(&state.k8s).router())
        .merge(Arc::clone(&state.mesos).router())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<ManagerState>>) -> impl IntoResponse {
    if state.is_ready().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    /// Keys with a live local session
    sessions: Vec<String>,
    proxy: MetricsSnapshot,
}

async fn statusz(State(state): State<Arc<ManagerState>>) -> Json<StatusReport> {
    let mut sessions = state.table.local_keys();
    sessions.sort();
    Json(StatusReport {
        sessions,
        proxy: state.metrics.snapshot(),
    })
}
