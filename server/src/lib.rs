//! Depot Server - reference REST backend for Depot clients.
//!
//! Serves the resource contract the sync core's HTTP backend speaks:
//! plain JSON records per resource, upserted on create, shallow-merged on
//! update. Records live in PostgreSQL, or in memory when no database is
//! configured.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;

use crate::config::Config;
use crate::db::RecordRepository;
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn RecordRepository>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(repo: Arc<dyn RecordRepository>, config: Config) -> Self {
        Self {
            repo,
            config: Arc::new(config),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}
