//! HTTP API server

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::query::QueryEngine;

pub mod handlers;

/// Build the API router
pub fn create_router(engine: Arc<QueryEngine>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .nest(
            "/v1",
            Router::new()
                .route("/domains/:domain", get(handlers::domain))
                .route(
                    "/domains/:domain/datasets/:dataset_id/urls",
                    get(handlers::urls),
                )
                .route("/reload", post(handlers::reload)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}
