//! # Webhook Ingress
//!
//! Handles push notifications from the remote calendar. The channel token
//! stored at registration is the only credential an inbound notification
//! carries, so it is always compared (in constant time) before any state is
//! touched. Change notifications trigger an import-only reconciliation;
//! exporting here could echo our own writes back as new notifications.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use metrics::counter;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use crate::models::calendar_connection::{self, ConnectionStatus};
use crate::repositories::ConnectionRepository;
use crate::sync::{SyncDirection, SyncEngine};

pub mod channel;

pub use channel::{ChannelError, ChannelManager};

pub const CHANNEL_ID_HEADER: &str = "x-goog-channel-id";
pub const CHANNEL_TOKEN_HEADER: &str = "x-goog-channel-token";
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";
pub const RESOURCE_ID_HEADER: &str = "x-goog-resource-id";

/// Provider headers of one notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub channel_id: Option<String>,
    pub channel_token: Option<String>,
    pub resource_state: Option<String>,
    pub resource_id: Option<String>,
}

impl WebhookHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Self {
            channel_id: get(CHANNEL_ID_HEADER),
            channel_token: get(CHANNEL_TOKEN_HEADER),
            resource_state: get(RESOURCE_STATE_HEADER),
            resource_id: get(RESOURCE_ID_HEADER),
        }
    }
}

/// The provider's resource-state signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    /// Channel handshake
    Sync,
    Exists,
    Update,
    /// The watched resource (or the channel) is gone
    NotExists,
    Unknown(String),
}

impl ResourceState {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("sync") => ResourceState::Sync,
            Some("exists") => ResourceState::Exists,
            Some("update") => ResourceState::Update,
            Some("not_exists") => ResourceState::NotExists,
            other => ResourceState::Unknown(other.unwrap_or_default().to_string()),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ResourceState::Sync => "sync",
            ResourceState::Exists => "exists",
            ResourceState::Update => "update",
            ResourceState::NotExists => "not_exists",
            ResourceState::Unknown(_) => "unknown",
        }
    }
}

/// Body returned to the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WebhookResponse {
    fn acknowledged(message: &str) -> Self {
        Self {
            success: true,
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    fn failed(error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Why a notification was refused. Messages name the category only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookRejection {
    MissingChannel,
    UnknownChannel,
    InvalidToken,
    Unavailable,
}

impl WebhookRejection {
    pub fn status(self) -> StatusCode {
        match self {
            WebhookRejection::MissingChannel => StatusCode::BAD_REQUEST,
            WebhookRejection::UnknownChannel => StatusCode::NOT_FOUND,
            WebhookRejection::InvalidToken => StatusCode::FORBIDDEN,
            WebhookRejection::Unavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            WebhookRejection::MissingChannel => "missing channel id",
            WebhookRejection::UnknownChannel => "not found",
            WebhookRejection::InvalidToken => "forbidden",
            WebhookRejection::Unavailable => "notification could not be processed",
        }
    }

    fn label(self) -> &'static str {
        match self {
            WebhookRejection::MissingChannel => "bad_request",
            WebhookRejection::UnknownChannel => "not_found",
            WebhookRejection::InvalidToken => "forbidden",
            WebhookRejection::Unavailable => "error",
        }
    }

    pub fn into_response_parts(self) -> (StatusCode, WebhookResponse) {
        (self.status(), WebhookResponse::failed(self.message()))
    }
}

/// Constant-time comparison of the presented token against the stored one.
/// A connection without a stored token never matches.
pub fn token_matches(stored: Option<&str>, presented: Option<&str>) -> bool {
    match (stored, presented) {
        (Some(stored), Some(presented)) if !stored.is_empty() => {
            bool::from(stored.as_bytes().ct_eq(presented.as_bytes()))
        }
        _ => false,
    }
}

/// The notification state machine.
#[derive(Clone)]
pub struct WebhookIngress {
    connections: ConnectionRepository,
    engine: Arc<SyncEngine>,
}

impl WebhookIngress {
    pub fn new(connections: ConnectionRepository, engine: Arc<SyncEngine>) -> Self {
        Self {
            connections,
            engine,
        }
    }

    /// Processes one notification. Reconciliation failures are reported in
    /// the body, never raised.
    #[instrument(skip_all, fields(resource_state = tracing::field::Empty, channel_id = tracing::field::Empty))]
    pub async fn handle(
        &self,
        headers: &WebhookHeaders,
    ) -> Result<WebhookResponse, WebhookRejection> {
        let state = ResourceState::parse(headers.resource_state.as_deref());
        let span = tracing::Span::current();
        span.record("resource_state", state.label());

        let result = self.dispatch(&state, headers).await;
        let outcome = match &result {
            Ok(response) if response.success => "success",
            Ok(_) => "failure",
            Err(rejection) => rejection.label(),
        };
        counter!("calendar_webhook_notifications_total", "state" => state.label(), "outcome" => outcome)
            .increment(1);
        result
    }

    async fn dispatch(
        &self,
        state: &ResourceState,
        headers: &WebhookHeaders,
    ) -> Result<WebhookResponse, WebhookRejection> {
        if *state == ResourceState::Sync {
            return Ok(WebhookResponse::acknowledged("sync acknowledged"));
        }

        let channel_id = headers
            .channel_id
            .as_deref()
            .ok_or(WebhookRejection::MissingChannel)?;
        tracing::Span::current().record("channel_id", channel_id);

        let connection = self.authenticate(channel_id, headers).await?;

        if connection.status == ConnectionStatus::Disconnected {
            info!(connection_id = %connection.id, "Notification for disconnected connection ignored");
            return Ok(WebhookResponse::acknowledged("connection disconnected"));
        }

        match state {
            ResourceState::Exists | ResourceState::Update => {
                let report = self.engine.sync(&connection, SyncDirection::Import).await;
                if report.is_success() {
                    Ok(WebhookResponse {
                        success: true,
                        imported: Some(report.imported),
                        errors: Some(report.errors),
                        ..Default::default()
                    })
                } else {
                    Ok(WebhookResponse {
                        success: false,
                        imported: Some(report.imported),
                        error: report.errors.first().cloned(),
                        errors: Some(report.errors),
                        message: None,
                    })
                }
            }
            ResourceState::NotExists => {
                // Retire the channel; the provider must not retry this notification.
                if let Err(err) = self
                    .connections
                    .clear_webhook_channel(
                        connection.tenant_id,
                        connection.id,
                        Some(ConnectionStatus::Error),
                    )
                    .await
                {
                    error!(connection_id = %connection.id, error = %err, "Failed to clear retired webhook channel");
                }
                Ok(WebhookResponse::acknowledged("channel retired"))
            }
            ResourceState::Unknown(value) => {
                warn!(resource_state = %value, "Ignoring notification with unknown resource state");
                Ok(WebhookResponse::acknowledged("ignored"))
            }
            ResourceState::Sync => Ok(WebhookResponse::acknowledged("sync acknowledged")),
        }
    }

    async fn authenticate(
        &self,
        channel_id: &str,
        headers: &WebhookHeaders,
    ) -> Result<calendar_connection::Model, WebhookRejection> {
        let connection = self
            .connections
            .find_by_webhook_channel(channel_id)
            .await
            .map_err(|err| {
                error!(error = %err, "Webhook channel lookup failed");
                WebhookRejection::Unavailable
            })?
            .ok_or_else(|| {
                warn!("Notification for unknown webhook channel");
                WebhookRejection::UnknownChannel
            })?;

        if !token_matches(
            connection.webhook_token.as_deref(),
            headers.channel_token.as_deref(),
        ) {
            warn!(
                connection_id = %connection.id,
                tenant_id = %connection.tenant_id,
                resource_id = ?headers.resource_id,
                "Webhook channel token mismatch"
            );
            return Err(WebhookRejection::InvalidToken);
        }

        Ok(connection)
    }
}
