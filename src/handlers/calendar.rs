//! # Calendar Connection Handlers
//!
//! Connect, OAuth callback, status, manual sync and disconnect for the
//! caller's calendar connection. Every lookup is scoped by the tenant and
//! principal from the request context, or by the verified state token in the
//! callback.

use axum::{
    extract::{Query, State, rejection::JsonRejection},
    response::{Json, Redirect},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use url::Url;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent};
use crate::auth::{ContextHeaders, RequestContext};
use crate::calendar::{GOOGLE_PROVIDER, PRIMARY_CALENDAR};
use crate::crypto;
use crate::error::{ApiError, conflict, not_found, validation_error};
use crate::models::calendar_connection::{self, ConnectionStatus};
use crate::oauth::{StateClaims, StateTokenError};
use crate::repositories::NewConnection;
use crate::server::AppState;
use crate::sync::{SyncDirection, SyncReport};

/// Authorization URL the browser should be sent to
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectResponse {
    /// Provider consent page carrying the signed state token
    pub authorization_url: String,
}

/// Query parameters the provider appends to the callback redirect
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackQuery {
    /// Authorization code
    pub code: Option<String>,
    /// State token issued by the connect endpoint
    pub state: Option<String>,
    /// Set by the provider when the user denied consent
    pub error: Option<String>,
}

/// Terminal states of the OAuth callback, carried back to the app as a query
/// parameter on the redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Connected,
    AuthFailed,
    InvalidRequest,
    InvalidState,
    SessionMismatch,
    Expired,
    TokenFailed,
}

impl CallbackOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CallbackOutcome::Connected => "connected",
            CallbackOutcome::AuthFailed => "auth_failed",
            CallbackOutcome::InvalidRequest => "invalid_request",
            CallbackOutcome::InvalidState => "invalid_state",
            CallbackOutcome::SessionMismatch => "session_mismatch",
            CallbackOutcome::Expired => "expired",
            CallbackOutcome::TokenFailed => "token_failed",
        }
    }

    fn query_key(self) -> &'static str {
        match self {
            CallbackOutcome::Connected => "success",
            _ => "error",
        }
    }

    /// Redirect target on the app for this outcome.
    pub fn redirect_url(self, app_redirect_url: &str) -> String {
        match Url::parse(app_redirect_url) {
            Ok(mut url) => {
                url.query_pairs_mut()
                    .append_pair(self.query_key(), self.as_str());
                url.to_string()
            }
            Err(_) => format!(
                "{}?{}={}",
                app_redirect_url,
                self.query_key(),
                self.as_str()
            ),
        }
    }
}

impl From<StateTokenError> for CallbackOutcome {
    fn from(error: StateTokenError) -> Self {
        match error {
            StateTokenError::SessionMismatch => CallbackOutcome::SessionMismatch,
            StateTokenError::Expired => CallbackOutcome::Expired,
            StateTokenError::Malformed
            | StateTokenError::InvalidSignature
            | StateTokenError::InvalidKey => CallbackOutcome::InvalidState,
        }
    }
}

/// Connection details without credentials
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionStatusResponse {
    pub id: Uuid,
    pub provider: String,
    pub calendar_id: String,
    /// `active`, `error` or `disconnected`
    pub status: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Sanitised message of the last failed pass
    pub last_error: Option<String>,
    /// Days relative to now where the sync window starts (<= 0)
    pub sync_range_start_days: i32,
    /// Days relative to now where the sync window ends (>= 0)
    pub sync_range_end_days: i32,
    pub webhook_active: bool,
    pub webhook_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&calendar_connection::Model> for ConnectionStatusResponse {
    fn from(connection: &calendar_connection::Model) -> Self {
        Self {
            id: connection.id,
            provider: connection.provider.clone(),
            calendar_id: connection.calendar_id.clone(),
            status: connection.status.as_str().to_string(),
            last_synced_at: connection.last_synced_at,
            last_error: connection.last_error.clone(),
            sync_range_start_days: connection.sync_range_start_days,
            sync_range_end_days: connection.sync_range_end_days,
            webhook_active: connection.has_webhook_channel(),
            webhook_expires_at: connection.webhook_expires_at,
            created_at: connection.created_at,
        }
    }
}

/// Manual sync request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SyncRequest {
    pub direction: SyncDirection,
}

/// Manual sync outcome. A failed pass is a normal outcome: `success` is
/// false and `errors` explains why.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SyncResponse {
    pub success: bool,
    pub imported: usize,
    pub exported: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub deleted: usize,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Another reconciliation for this connection was already running
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl From<SyncReport> for SyncResponse {
    fn from(report: SyncReport) -> Self {
        Self {
            success: report.is_success(),
            imported: report.imported,
            exported: report.exported,
            deleted: report.deleted,
            errors: report.errors,
            skipped: report.skipped,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DisconnectResponse {
    pub success: bool,
}

/// Start connecting the caller's calendar
///
/// Returns the provider consent URL. The embedded state token is bound to the
/// caller's session cookie and expires after ten minutes.
#[utoipa::path(
    post,
    path = "/api/calendar/connect",
    security(("bearer_auth" = [])),
    params(ContextHeaders),
    responses(
        (status = 200, description = "Authorization URL generated", body = ConnectResponse),
        (status = 400, description = "Missing context headers or session cookie", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 409, description = "An active connection already exists", body = ApiError),
        (status = 500, description = "OAuth client not configured", body = ApiError)
    ),
    tag = "calendar"
)]
#[instrument(skip_all, fields(tenant_id = %context.tenant_id, principal_id = %context.principal_id))]
pub async fn connect(
    State(state): State<AppState>,
    context: RequestContext,
) -> Result<Json<ConnectResponse>, ApiError> {
    let session_id = context.session_id.as_deref().ok_or_else(|| {
        validation_error(
            "Session cookie required",
            serde_json::json!({ "cookie": format!("{} cookie is missing", state.config.session_cookie_name) }),
        )
    })?;

    let existing = state
        .connections
        .find_for_principal(context.tenant_id, context.principal_id, GOOGLE_PROVIDER)
        .await?;
    if existing.is_some_and(|connection| connection.status == ConnectionStatus::Active) {
        return Err(conflict("Calendar is already connected"));
    }

    let claims = StateClaims::new(session_id, context.tenant_id, context.principal_id);
    let state_token = state.state_signer.issue(&claims).map_err(|err| {
        error!(error = %err, "Failed to sign OAuth state");
        ApiError::from(anyhow::anyhow!("state token signing failed"))
    })?;
    let authorization_url = state.oauth.build_authorization_url(&state_token)?;

    info!("OAuth flow initiated");
    Ok(Json(ConnectResponse {
        authorization_url: authorization_url.to_string(),
    }))
}

/// Finish connecting the calendar
///
/// Reached through a browser redirect from the provider. Always answers with
/// a redirect to the app carrying `success=connected` or `error=<code>`.
#[utoipa::path(
    get,
    path = "/api/calendar/callback",
    params(CallbackQuery),
    responses(
        (status = 303, description = "Redirect to the app with the outcome in the query string")
    ),
    tag = "calendar"
)]
pub async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    let session_id = jar
        .get(&state.config.session_cookie_name)
        .map(|cookie| cookie.value().to_string());

    let outcome = complete_callback(&state, query, session_id.as_deref()).await;
    Redirect::to(&outcome.redirect_url(&state.config.app_redirect_url))
}

/// Runs the callback steps and reports the terminal state.
///
/// Nothing is written before the state token has been verified. The initial
/// import and the webhook registration are best effort.
#[instrument(skip_all)]
pub async fn complete_callback(
    state: &AppState,
    query: CallbackQuery,
    session_id: Option<&str>,
) -> CallbackOutcome {
    if let Some(provider_error) = query.error.as_deref() {
        warn!(provider_error, "Provider reported an authorization failure");
        return CallbackOutcome::AuthFailed;
    }

    let (Some(code), Some(state_token)) = (
        query.code.as_deref().filter(|value| !value.is_empty()),
        query.state.as_deref().filter(|value| !value.is_empty()),
    ) else {
        return CallbackOutcome::InvalidRequest;
    };

    let claims = match state
        .state_signer
        .validate(state_token, session_id, Utc::now())
    {
        Ok(claims) => claims,
        Err(err) => {
            warn!(error = %err, "Rejected OAuth state token");
            return err.into();
        }
    };

    let tenant_id = claims.tenant_id;
    let principal_id = claims.principal_id;

    let tokens = match state.oauth.exchange_code(code).await {
        Ok(tokens) => tokens,
        Err(err) => {
            error!(%tenant_id, %principal_id, error = %err, "Authorization code exchange failed");
            return CallbackOutcome::TokenFailed;
        }
    };

    let ciphertexts = crypto::encrypt(&tokens.access_token, &state.crypto_key).and_then(
        |access| {
            crypto::encrypt(&tokens.refresh_token, &state.crypto_key)
                .map(|refresh| (access, refresh))
        },
    );
    let (access_token_ciphertext, refresh_token_ciphertext) = match ciphertexts {
        Ok(pair) => pair,
        Err(err) => {
            error!(%tenant_id, %principal_id, error = %err, "Failed to encrypt OAuth tokens");
            return CallbackOutcome::TokenFailed;
        }
    };

    let new_connection = NewConnection {
        tenant_id,
        principal_id,
        provider: GOOGLE_PROVIDER.to_string(),
        calendar_id: PRIMARY_CALENDAR.to_string(),
        access_token_ciphertext,
        refresh_token_ciphertext,
        token_expires_at: tokens.expires_at,
        sync_range_start_days: state.config.sync_range_start_days,
        sync_range_end_days: state.config.sync_range_end_days,
    };
    let mut connection = match state.connections.upsert_authorized(new_connection).await {
        Ok(connection) => connection,
        Err(err) => {
            error!(%tenant_id, %principal_id, error = %err, "Failed to store calendar connection");
            return CallbackOutcome::TokenFailed;
        }
    };
    info!(connection_id = %connection.id, %tenant_id, "Calendar connection established");

    let report = state
        .sync_engine
        .sync(&connection, SyncDirection::Import)
        .await;
    if !report.is_success() {
        warn!(
            connection_id = %connection.id,
            errors = ?report.errors,
            "Initial import failed; connection kept"
        );
    }

    if state.channels.is_enabled() {
        // The import may have moved the connection to `error`; reload so the
        // channel is stored against current values.
        if let Ok(Some(current)) = state.connections.find_by_id(tenant_id, connection.id).await {
            connection = current;
        }
        if let Err(err) = state.channels.register(&mut connection).await {
            warn!(connection_id = %connection.id, error = %err, "Webhook registration failed; continuing without push notifications");
        }
    }

    state.audit.record(
        AuditEvent::new(AuditAction::ConnectionEstablished, tenant_id, principal_id)
            .with("provider", GOOGLE_PROVIDER)
            .with("imported", report.imported),
    );

    CallbackOutcome::Connected
}

/// Show the caller's calendar connection
#[utoipa::path(
    get,
    path = "/api/calendar/connection",
    security(("bearer_auth" = [])),
    params(ContextHeaders),
    responses(
        (status = 200, description = "Connection details", body = ConnectionStatusResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "No calendar connected", body = ApiError)
    ),
    tag = "calendar"
)]
pub async fn connection_status(
    State(state): State<AppState>,
    context: RequestContext,
) -> Result<Json<ConnectionStatusResponse>, ApiError> {
    let connection = state
        .connections
        .find_for_principal(context.tenant_id, context.principal_id, GOOGLE_PROVIDER)
        .await?
        .ok_or_else(|| not_found("No calendar connected"))?;

    Ok(Json(ConnectionStatusResponse::from(&connection)))
}

/// Reconcile the caller's calendar now
#[utoipa::path(
    post,
    path = "/api/calendar/sync",
    security(("bearer_auth" = [])),
    params(ContextHeaders),
    request_body = SyncRequest,
    responses(
        (status = 200, description = "Reconciliation ran; see success and errors", body = SyncResponse),
        (status = 400, description = "Invalid direction", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "No calendar connected", body = ApiError)
    ),
    tag = "calendar"
)]
#[instrument(skip_all, fields(tenant_id = %context.tenant_id, principal_id = %context.principal_id))]
pub async fn manual_sync(
    State(state): State<AppState>,
    context: RequestContext,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncResponse>, ApiError> {
    let Json(request) = payload?;

    let connection = state
        .connections
        .find_for_principal(context.tenant_id, context.principal_id, GOOGLE_PROVIDER)
        .await?
        .ok_or_else(|| not_found("No calendar connected"))?;

    let report = state.sync_engine.sync(&connection, request.direction).await;

    if report.is_success() && !report.skipped {
        renew_channel(&state, context.tenant_id, connection.id).await;
    }

    state.audit.record(
        AuditEvent::new(
            AuditAction::ManualSync,
            context.tenant_id,
            context.principal_id,
        )
        .with("provider", GOOGLE_PROVIDER)
        .with("direction", request.direction.as_str())
        .with("imported", report.imported)
        .with("exported", report.exported)
        .with("errors", report.errors.len()),
    );

    Ok(Json(SyncResponse::from(report)))
}

async fn renew_channel(state: &AppState, tenant_id: Uuid, connection_id: Uuid) {
    if !state.channels.is_enabled() {
        return;
    }
    let mut connection = match state.connections.find_by_id(tenant_id, connection_id).await {
        Ok(Some(connection)) => connection,
        Ok(None) => return,
        Err(err) => {
            warn!(%connection_id, error = %err, "Could not reload connection for channel renewal");
            return;
        }
    };
    match state.channels.renew_if_needed(&mut connection).await {
        Ok(true) => info!(%connection_id, "Webhook channel renewed"),
        Ok(false) => {}
        Err(err) => warn!(%connection_id, error = %err, "Webhook channel renewal failed"),
    }
}

/// Disconnect the caller's calendar
///
/// Stops the webhook channel and revokes the grant on a best-effort basis,
/// then deletes the connection.
#[utoipa::path(
    delete,
    path = "/api/calendar/connection",
    security(("bearer_auth" = [])),
    params(ContextHeaders),
    responses(
        (status = 200, description = "Connection removed", body = DisconnectResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "No calendar connected", body = ApiError)
    ),
    tag = "calendar"
)]
#[instrument(skip_all, fields(tenant_id = %context.tenant_id, principal_id = %context.principal_id))]
pub async fn disconnect(
    State(state): State<AppState>,
    context: RequestContext,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let mut connection = state
        .connections
        .find_for_principal(context.tenant_id, context.principal_id, GOOGLE_PROVIDER)
        .await?
        .ok_or_else(|| not_found("No calendar connected"))?;

    state.channels.stop(&mut connection).await;

    match state.tokens.stored_access_token(&connection) {
        Ok(access_token) => {
            if let Err(err) = state.oauth.revoke(&access_token).await {
                warn!(connection_id = %connection.id, error = %err, "Token revocation failed; deleting connection anyway");
            }
        }
        Err(err) => {
            warn!(connection_id = %connection.id, error = %err, "Stored token unreadable; skipping revocation")
        }
    }

    state
        .connections
        .delete(context.tenant_id, connection.id)
        .await?;
    info!(connection_id = %connection.id, "Calendar connection removed");

    state.audit.record(
        AuditEvent::new(
            AuditAction::ConnectionRemoved,
            context.tenant_id,
            context.principal_id,
        )
        .with("provider", connection.provider.as_str()),
    );

    Ok(Json(DisconnectResponse { success: true }))
}
