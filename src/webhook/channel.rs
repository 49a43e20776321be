//! Push-notification channel provisioning: register, renew and retire.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::calendar::{CalendarClient, CalendarError, CalendarSession};
use crate::models::calendar_connection;
use crate::oauth::{TokenError, TokenManager};
use crate::repositories::{ConnectionRepository, WebhookChannel};

/// Channels expiring sooner than this are replaced on renewal.
pub const RENEWAL_MARGIN_HOURS: i64 = 24;

const CHANNEL_TOKEN_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("channel request failed: {0}")]
    Calendar(#[from] CalendarError),
    #[error("failed to store channel: {0}")]
    Store(anyhow::Error),
}

/// Random verification token handed to the provider with each channel.
pub fn generate_channel_token() -> String {
    let mut bytes = [0u8; CHANNEL_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Whether a connection's channel is missing or about to expire.
pub fn needs_renewal(connection: &calendar_connection::Model, now: DateTime<Utc>) -> bool {
    if !connection.has_webhook_channel() {
        return true;
    }
    match connection.webhook_expires_at {
        Some(expires_at) => expires_at - now < TimeDelta::hours(RENEWAL_MARGIN_HOURS),
        None => false,
    }
}

/// Opens and closes push channels for connections.
///
/// Every operation is a no-op when no callback URL is configured (developer
/// profiles and loopback hosts), since the provider could not reach us.
#[derive(Clone)]
pub struct ChannelManager {
    calendar: Arc<dyn CalendarClient>,
    connections: ConnectionRepository,
    tokens: TokenManager,
    callback_url: Option<Url>,
}

impl ChannelManager {
    pub fn new(
        calendar: Arc<dyn CalendarClient>,
        connections: ConnectionRepository,
        tokens: TokenManager,
        callback_url: Option<Url>,
    ) -> Self {
        Self {
            calendar,
            connections,
            tokens,
            callback_url,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.callback_url.is_some()
    }

    /// Registers a new channel and stores it on the connection. A channel
    /// already stored on the connection is stopped once the new one is in place.
    ///
    /// Returns `Ok(None)` when webhooks are disabled for this environment.
    #[instrument(skip_all, fields(connection_id = %connection.id, tenant_id = %connection.tenant_id))]
    pub async fn register(
        &self,
        connection: &mut calendar_connection::Model,
    ) -> Result<Option<WebhookChannel>, ChannelError> {
        let Some(callback_url) = self.callback_url.as_ref() else {
            debug!("Webhook callback URL not reachable from the provider; skipping registration");
            return Ok(None);
        };

        let previous = connection
            .webhook_channel_id
            .clone()
            .zip(connection.webhook_resource_id.clone());
        let session = CalendarSession::new(self.tokens.live_access_token(connection).await?);
        let token = generate_channel_token();
        let registration = self
            .calendar
            .register_webhook(&session, &connection.calendar_id, callback_url, &token)
            .await?;

        let channel = WebhookChannel {
            channel_id: registration.channel_id,
            resource_id: registration.resource_id,
            token,
            expires_at: registration.expires_at,
        };
        self.connections
            .set_webhook_channel(connection.tenant_id, connection.id, &channel)
            .await
            .map_err(ChannelError::Store)?;

        connection.webhook_channel_id = Some(channel.channel_id.clone());
        connection.webhook_resource_id = Some(channel.resource_id.clone());
        connection.webhook_token = Some(channel.token.clone());
        connection.webhook_expires_at = channel.expires_at;

        info!(
            channel_id = %channel.channel_id,
            expires_at = ?channel.expires_at,
            "Webhook channel registered"
        );

        if let Some((channel_id, resource_id)) = previous {
            self.deregister(&session, &channel_id, &resource_id).await;
        }
        Ok(Some(channel))
    }

    /// Best-effort stop of the connection's current channel. Failures are logged.
    #[instrument(skip_all, fields(connection_id = %connection.id, tenant_id = %connection.tenant_id))]
    pub async fn stop(&self, connection: &mut calendar_connection::Model) {
        let (Some(channel_id), Some(resource_id)) = (
            connection.webhook_channel_id.clone(),
            connection.webhook_resource_id.clone(),
        ) else {
            return;
        };

        let access_token = match self.tokens.live_access_token(connection).await {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, %channel_id, "Cannot stop webhook channel without a live token");
                return;
            }
        };
        self.deregister(&CalendarSession::new(access_token), &channel_id, &resource_id)
            .await;
    }

    /// Replaces the channel when it is missing or expires within
    /// [`RENEWAL_MARGIN_HOURS`]. Returns whether a new channel was registered.
    pub async fn renew_if_needed(
        &self,
        connection: &mut calendar_connection::Model,
    ) -> Result<bool, ChannelError> {
        if !self.is_enabled() || !needs_renewal(connection, Utc::now()) {
            return Ok(false);
        }

        Ok(self.register(connection).await?.is_some())
    }

    async fn deregister(&self, session: &CalendarSession, channel_id: &str, resource_id: &str) {
        match self
            .calendar
            .deregister_webhook(session, channel_id, resource_id)
            .await
        {
            Ok(()) => info!(%channel_id, "Webhook channel stopped"),
            Err(CalendarError::NotFound) => debug!(%channel_id, "Webhook channel already gone"),
            Err(err) => warn!(error = %err, %channel_id, "Failed to stop webhook channel"),
        }
    }
}
