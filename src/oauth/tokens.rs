//! Token freshness policy: callers never see a stale access token.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::client::{GoogleOAuthClient, OAuthError};
use crate::crypto::{self, CryptoKey, VaultError};
use crate::models::calendar_connection;
use crate::repositories::ConnectionRepository;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("stored access token is unreadable: {0}")]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Refresh(#[from] OAuthError),
    #[error("failed to persist refreshed token: {0}")]
    Persistence(anyhow::Error),
}

/// Hands out live access tokens, refreshing and persisting them first when needed.
#[derive(Clone)]
pub struct TokenManager {
    oauth: Arc<GoogleOAuthClient>,
    connections: ConnectionRepository,
    key: CryptoKey,
    skew: TimeDelta,
}

impl TokenManager {
    pub fn new(
        oauth: Arc<GoogleOAuthClient>,
        connections: ConnectionRepository,
        key: CryptoKey,
        skew_seconds: i64,
    ) -> Self {
        // Clamped to a day; larger margins would refresh on every call anyway.
        let skew = TimeDelta::seconds(skew_seconds.clamp(0, 86_400));
        Self {
            oauth,
            connections,
            key,
            skew,
        }
    }

    /// True when the token expiring at `expires_at` must be refreshed before use.
    pub fn is_stale(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expires_at <= now + self.skew
    }

    /// Returns a usable access token for `connection`.
    ///
    /// A stale token is refreshed, re-encrypted and persisted, and `connection`
    /// is updated in place so later steps of the same pass see the new values.
    #[instrument(skip_all, fields(connection_id = %connection.id, tenant_id = %connection.tenant_id))]
    pub async fn live_access_token(
        &self,
        connection: &mut calendar_connection::Model,
    ) -> Result<String, TokenError> {
        if !self.is_stale(connection.token_expires_at, Utc::now()) {
            return Ok(crypto::decrypt(&connection.access_token_ciphertext, &self.key)?);
        }

        let refreshed = match self
            .oauth
            .refresh(&connection.refresh_token_ciphertext, &self.key)
            .await
        {
            Ok(refreshed) => refreshed,
            Err(err) => {
                counter!("calendar_token_refresh_total", "outcome" => "failure").increment(1);
                warn!(error = %err, "Access token refresh failed");
                return Err(err.into());
            }
        };

        let access_cipher = crypto::encrypt(&refreshed.access_token, &self.key)?;
        let refresh_cipher = refreshed
            .refresh_token
            .as_deref()
            .map(|token| crypto::encrypt(token, &self.key))
            .transpose()?;

        self.connections
            .update_tokens(
                connection.tenant_id,
                connection.id,
                access_cipher.clone(),
                refresh_cipher.clone(),
                refreshed.expires_at,
            )
            .await
            .map_err(TokenError::Persistence)?;

        connection.access_token_ciphertext = access_cipher;
        if let Some(refresh_cipher) = refresh_cipher {
            connection.refresh_token_ciphertext = refresh_cipher;
        }
        connection.token_expires_at = refreshed.expires_at;

        counter!("calendar_token_refresh_total", "outcome" => "success").increment(1);
        info!(expires_at = %refreshed.expires_at, "Access token refreshed");

        Ok(refreshed.access_token)
    }

    /// Decrypts the stored access token without refreshing it.
    pub fn stored_access_token(
        &self,
        connection: &calendar_connection::Model,
    ) -> Result<String, TokenError> {
        Ok(crypto::decrypt(&connection.access_token_ciphertext, &self.key)?)
    }
}
