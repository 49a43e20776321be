//! # Webhook Handler
//!
//! Receives push notifications from the calendar provider. Authentication is
//! the channel token carried in the provider headers, not the request context.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::server::AppState;
use crate::webhook::{WebhookHeaders, WebhookResponse};

/// Provider headers describing a notification
#[derive(Debug, Serialize, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Header)]
pub struct ChannelHeaders {
    /// Channel identifier chosen at registration
    #[serde(rename = "X-Goog-Channel-ID")]
    #[param(rename = "X-Goog-Channel-ID", value_type = String)]
    pub channel_id: String,
    /// Verification token chosen at registration
    #[serde(rename = "X-Goog-Channel-Token")]
    #[param(rename = "X-Goog-Channel-Token", value_type = String)]
    pub channel_token: String,
    /// `sync`, `exists`, `update` or `not_exists`
    #[serde(rename = "X-Goog-Resource-State")]
    #[param(rename = "X-Goog-Resource-State", value_type = String)]
    pub resource_state: String,
    /// Provider identifier of the watched resource
    #[serde(rename = "X-Goog-Resource-ID")]
    #[param(rename = "X-Goog-Resource-ID", value_type = String)]
    pub resource_id: Option<String>,
}

/// Receive a calendar push notification
///
/// Change notifications trigger an import-only reconciliation. Failures of
/// that reconciliation are reported in the body with a 200 status.
#[utoipa::path(
    post,
    path = "/api/calendar/webhook",
    params(ChannelHeaders),
    responses(
        (status = 200, description = "Notification processed", body = WebhookResponse),
        (status = 400, description = "Missing channel id", body = WebhookResponse),
        (status = 403, description = "Channel token mismatch", body = WebhookResponse),
        (status = 404, description = "Unknown channel", body = WebhookResponse),
        (status = 500, description = "Notification could not be processed", body = WebhookResponse)
    ),
    tag = "webhooks"
)]
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> (StatusCode, Json<WebhookResponse>) {
    let headers = WebhookHeaders::from_headers(&headers);
    match state.webhooks.handle(&headers).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(rejection) => {
            let (status, body) = rejection.into_response_parts();
            (status, Json(body))
        }
    }
}
