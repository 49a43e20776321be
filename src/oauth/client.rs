//! Google OAuth 2.0 endpoints: authorization URL, code exchange, refresh and revocation.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::config::AppConfig;
use crate::crypto::{self, CryptoKey, VaultError};
use crate::error::truncate_body;

/// Read and write access to calendar events.
pub const CALENDAR_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/calendar.readonly",
    "https://www.googleapis.com/auth/calendar.events",
];

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECONDS: i64 = 3600;

/// Upper bound on a reported token lifetime.
const MAX_TOKEN_LIFETIME_SECONDS: i64 = 86_400;

/// Longest provider error body kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth client is not configured: missing {0}")]
    ConfigurationMissing(&'static str),
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("token revocation failed: {0}")]
    RevocationFailed(String),
    #[error("stored credential is unreadable: {0}")]
    Vault(#[from] VaultError),
}

/// Tokens obtained from a successful code exchange.
#[derive(Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of refreshing an access token.
#[derive(Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Set when the provider rotated the refresh token
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OAuth endpoint settings taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
}

impl OAuthSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client_id: config.google_client_id.clone(),
            client_secret: config.google_client_secret.clone(),
            redirect_uri: config.google_redirect_uri.clone(),
            auth_url: config.google_auth_url.clone(),
            token_url: config.google_token_url.clone(),
            revoke_url: config.google_revoke_url.clone(),
        }
    }
}

struct Credentials<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    redirect_uri: &'a str,
}

/// Client for the provider's OAuth endpoints.
#[derive(Clone)]
pub struct GoogleOAuthClient {
    settings: OAuthSettings,
    http_client: Client,
}

impl GoogleOAuthClient {
    pub fn new(settings: OAuthSettings, http_client: Client) -> Self {
        Self {
            settings,
            http_client,
        }
    }

    fn credentials(&self) -> Result<Credentials<'_>, OAuthError> {
        fn present(value: &Option<String>) -> Option<&str> {
            value.as_deref().filter(|v| !v.is_empty())
        }

        Ok(Credentials {
            client_id: present(&self.settings.client_id)
                .ok_or(OAuthError::ConfigurationMissing("client id"))?,
            client_secret: present(&self.settings.client_secret)
                .ok_or(OAuthError::ConfigurationMissing("client secret"))?,
            redirect_uri: present(&self.settings.redirect_uri)
                .ok_or(OAuthError::ConfigurationMissing("redirect uri"))?,
        })
    }

    /// Build the consent URL. Requests offline access and forces the consent
    /// screen so a refresh token is issued even on re-authorization.
    pub fn build_authorization_url(&self, state: &str) -> Result<Url, OAuthError> {
        let credentials = self.credentials()?;
        let mut url = Url::parse(&self.settings.auth_url)
            .map_err(|_| OAuthError::ConfigurationMissing("valid authorization endpoint"))?;

        url.query_pairs_mut()
            .append_pair("client_id", credentials.client_id)
            .append_pair("redirect_uri", credentials.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &CALENDAR_SCOPES.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("include_granted_scopes", "true")
            .append_pair("state", state);

        Ok(url)
    }

    /// Exchange an authorization code for tokens. A response without a refresh
    /// token is a failure: the connection could not outlive the access token.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet, OAuthError> {
        let credentials = self.credentials()?;

        let mut params = HashMap::new();
        params.insert("client_id", credentials.client_id);
        params.insert("client_secret", credentials.client_secret);
        params.insert("code", code);
        params.insert("grant_type", "authorization_code");
        params.insert("redirect_uri", credentials.redirect_uri);

        let response = self
            .http_client
            .post(&self.settings.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::TokenExchangeFailed(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenExchangeFailed(format!(
                "provider returned {}: {}",
                status,
                truncate(&body)
            )));
        }

        let token = response
            .json::<GoogleTokenResponse>()
            .await
            .map_err(|e| OAuthError::TokenExchangeFailed(format!("invalid response: {}", e)))?;

        let refresh_token = token
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                OAuthError::TokenExchangeFailed("provider did not issue a refresh token".into())
            })?;

        Ok(TokenSet {
            expires_at: expiry_from(token.expires_in),
            access_token: token.access_token,
            refresh_token,
        })
    }

    /// Decrypt `encrypted_refresh_token` and obtain a new access token.
    pub async fn refresh(
        &self,
        encrypted_refresh_token: &str,
        key: &CryptoKey,
    ) -> Result<RefreshedToken, OAuthError> {
        let credentials = self.credentials()?;
        let refresh_token = crypto::decrypt(encrypted_refresh_token, key)?;
        if refresh_token.is_empty() {
            return Err(OAuthError::RefreshFailed("no refresh token stored".into()));
        }

        let mut params = HashMap::new();
        params.insert("client_id", credentials.client_id);
        params.insert("client_secret", credentials.client_secret);
        params.insert("refresh_token", refresh_token.as_str());
        params.insert("grant_type", "refresh_token");

        let response = self
            .http_client
            .post(&self.settings.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::RefreshFailed(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::RefreshFailed(format!(
                "provider returned {}: {}",
                status,
                truncate(&body)
            )));
        }

        let token = response
            .json::<GoogleTokenResponse>()
            .await
            .map_err(|e| OAuthError::RefreshFailed(format!("invalid response: {}", e)))?;

        Ok(RefreshedToken {
            expires_at: expiry_from(token.expires_in),
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
        })
    }

    /// Revoke a token at the provider. Callers treat failure as non-fatal.
    pub async fn revoke(&self, access_token: &str) -> Result<(), OAuthError> {
        let mut params = HashMap::new();
        params.insert("token", access_token);

        let response = self
            .http_client
            .post(&self.settings.revoke_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::RevocationFailed(format!("request failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // Already revoked or expired tokens are reported as invalid_token.
            StatusCode::BAD_REQUEST => {
                let body = response.text().await.unwrap_or_default();
                if body.contains("invalid_token") {
                    Ok(())
                } else {
                    Err(OAuthError::RevocationFailed(format!(
                        "provider returned 400: {}",
                        truncate(&body)
                    )))
                }
            }
            status => Err(OAuthError::RevocationFailed(format!(
                "provider returned {}",
                status
            ))),
        }
    }
}

fn expiry_from(expires_in: Option<i64>) -> DateTime<Utc> {
    let seconds = expires_in
        .filter(|s| *s > 0)
        .map_or(DEFAULT_TOKEN_LIFETIME_SECONDS, |s| s.min(MAX_TOKEN_LIFETIME_SECONDS));
    Utc::now() + TimeDelta::seconds(seconds)
}

fn truncate(body: &str) -> String {
    truncate_body(body, MAX_ERROR_BODY_CHARS)
}
