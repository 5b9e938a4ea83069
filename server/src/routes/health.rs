//! Health check endpoint, used by clients to probe reachability.

use axum::{extract::State, routing::get, Json, Router};
use depot_engine::remote::wire::{HealthResponse, HEALTH_PATH};

use crate::error::Result;
use crate::AppState;

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(HEALTH_PATH, get(health_check))
        .route("/", get(root))
}

/// Health check handler. Fails with 500 when storage is unavailable.
async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    state.repo.ping().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Root handler.
async fn root() -> &'static str {
    "Depot Server"
}
