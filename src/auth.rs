//! # Request Context
//!
//! Operator bearer authentication plus the tenant, principal and session
//! context the Lifecycle API trusts. The upstream gateway authenticates end
//! users; this service only checks that the request came through it.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized, validation_error};
use crate::server::AppState;

pub const TENANT_HEADER: &str = "X-Tenant-Id";
pub const PRINCIPAL_HEADER: &str = "X-Principal-Id";

/// Identity of the caller, inserted into request extensions by [`auth_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: Uuid,
    pub principal_id: Uuid,
    /// Value of the session cookie, when present
    pub session_id: Option<String>,
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Validates the bearer token and the identity headers, then records the
/// [`RequestContext`] for handlers.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();

    let token = extract_bearer_token(headers)?;
    validate_token(&config, token)?;

    let tenant_id = extract_uuid_header(headers, TENANT_HEADER)?;
    let principal_id = extract_uuid_header(headers, PRINCIPAL_HEADER)?;
    let session_id = jar
        .get(&config.session_cookie_name)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty());

    tracing::debug!(%tenant_id, %principal_id, "Authenticated operator request");

    request.extensions_mut().insert(RequestContext {
        tenant_id,
        principal_id,
        session_id,
    });

    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_uuid_header(headers: &HeaderMap, name: &'static str) -> Result<Uuid, ApiError> {
    let value = headers
        .get(name)
        .ok_or_else(|| {
            validation_error(
                "Missing required header",
                serde_json::json!({ name: "Required header is missing" }),
            )
        })?
        .to_str()
        .map_err(|_| {
            validation_error(
                "Invalid header",
                serde_json::json!({ name: "Header must be valid UTF-8" }),
            )
        })?;

    value.trim().parse::<Uuid>().map_err(|_| {
        validation_error(
            "Invalid identifier",
            serde_json::json!({ name: "Must be a valid UUID" }),
        )
    })
}

/// OpenAPI header parameters for the request context.
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct ContextHeaders {
    /// Tenant identifier (UUID) that scopes the request
    #[serde(rename = "X-Tenant-Id")]
    #[param(rename = "X-Tenant-Id", value_type = String)]
    pub tenant_id: String,
    /// Principal (user) identifier (UUID) acting within the tenant
    #[serde(rename = "X-Principal-Id")]
    #[param(rename = "X-Principal-Id", value_type = String)]
    pub principal_id: String,
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or_else(|| unauthorized(Some("Request context missing")))
    }
}
