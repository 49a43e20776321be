//! # API Handlers
//!
//! HTTP endpoints for the connection lifecycle, provider webhooks and health.

use axum::{extract::State, http::StatusCode, response::Json};

use crate::db;
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod calendar;
pub mod webhook;

/// Liveness plus a database ping
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service and database are healthy", body = ServiceInfo),
        (status = 503, description = "Database unreachable", body = ServiceInfo)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ServiceInfo>) {
    match db::health_check(&state.db).await {
        Ok(()) => (StatusCode::OK, Json(ServiceInfo::with_database_status(true))),
        Err(err) => {
            tracing::warn!(error = %err, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ServiceInfo::with_database_status(false)),
            )
        }
    }
}
