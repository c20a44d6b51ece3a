//! API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::query::{DomainResponse, QueryEngine, UrlsResponse};
use crate::types::DatasetId;
use crate::Error;

/// Hard ceiling on page size.
const MAX_LIMIT: usize = 10_000;
const DEFAULT_LIMIT: usize = 1_000;

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

/// Unknown domains and mismatched datasets are 404 with the offending key
/// echoed; everything else is a 500 with a stable code and no internals.
fn map_error(error: Error) -> ApiError {
    let status = match &error {
        Error::DomainNotFound(_) | Error::DatasetMismatch { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let message = if status == StatusCode::NOT_FOUND {
        error.to_string()
    } else {
        tracing::error!("Query failed: {}", error);
        "internal error".to_string()
    };

    (
        status,
        Json(ErrorResponse {
            code: error.code(),
            message,
        }),
    )
}

/// Health check with the loaded index version
pub async fn health(
    State(engine): State<Arc<QueryEngine>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let stats = engine.stats();

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        index_version: stats.version,
        domains: stats.num_domains,
        files: stats.num_files,
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub index_version: String,
    pub domains: usize,
    pub files: usize,
}

/// Datasets containing a domain
pub async fn domain(
    State(engine): State<Arc<QueryEngine>>,
    Path(domain): Path<String>,
) -> Result<Json<DomainResponse>, ApiError> {
    engine
        .datasets_for_domain(&domain)
        .await
        .map(Json)
        .map_err(map_error)
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

/// Paginated URLs of one (domain, dataset) pair
pub async fn urls(
    State(engine): State<Arc<QueryEngine>>,
    Path((domain, dataset_id)): Path<(String, DatasetId)>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<UrlsResponse>, ApiError> {
    let limit = pagination.limit.clamp(1, MAX_LIMIT);

    engine
        .urls_for(&domain, dataset_id, pagination.offset, limit)
        .await
        .map(Json)
        .map_err(map_error)
}

/// Pick up a newly published version without restarting
pub async fn reload(
    State(engine): State<Arc<QueryEngine>>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let reloaded = engine.reload().await.map_err(map_error)?;
    let stats = engine.stats();

    Ok(Json(ReloadResponse {
        reloaded,
        index_version: stats.version,
    }))
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub reloaded: bool,
    pub index_version: String,
}
