// Health endpoint over the task manager

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use taskforge::{HealthSnapshot, HealthStatus, TaskManager};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TaskManager>,
}

/// 503 once the manager reports `error`
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = state.manager.health().await;
    let status = match snapshot.status {
        HealthStatus::Error => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Ok | HealthStatus::Warn => StatusCode::OK,
    };
    (status, Json(snapshot))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}
