//! Signed OAuth state tokens.
//!
//! The state parameter round-trips through the provider's redirect and is
//! never persisted. It binds the flow to the initiating session, tenant and
//! principal: `base64url(json claims) "." base64url(hmac_sha256(claims))`.

use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// State tokens older than this are rejected.
pub const STATE_TTL_SECONDS: i64 = 10 * 60;

/// Tolerated clock skew for tokens that claim to be issued in the future.
const FUTURE_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateTokenError {
    #[error("state token is malformed")]
    Malformed,
    #[error("state token signature is invalid")]
    InvalidSignature,
    #[error("state token does not belong to the current session")]
    SessionMismatch,
    #[error("state token has expired")]
    Expired,
    #[error("state signing key is unusable")]
    InvalidKey,
}

/// Claims carried inside a state token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateClaims {
    #[serde(rename = "sid")]
    pub session_id: String,
    #[serde(rename = "tid")]
    pub tenant_id: Uuid,
    #[serde(rename = "pid")]
    pub principal_id: Uuid,
    #[serde(rename = "iat")]
    pub issued_at: i64,
}

impl StateClaims {
    pub fn new(session_id: impl Into<String>, tenant_id: Uuid, principal_id: Uuid) -> Self {
        Self {
            session_id: session_id.into(),
            tenant_id,
            principal_id,
            issued_at: Utc::now().timestamp(),
        }
    }

    fn issued_at_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.issued_at, 0)
    }
}

/// Issues and verifies state tokens with a server-side HMAC key.
#[derive(Clone)]
pub struct StateSigner {
    mac: HmacSha256,
}

impl StateSigner {
    pub fn new(secret: &[u8]) -> Result<Self, StateTokenError> {
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| StateTokenError::InvalidKey)?;
        Ok(Self { mac })
    }

    /// Encode and sign `claims`.
    pub fn issue(&self, claims: &StateClaims) -> Result<String, StateTokenError> {
        let payload = serde_json::to_vec(claims).map_err(|_| StateTokenError::Malformed)?;
        let mut mac = self.mac.clone();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            base64_url::encode(&payload),
            base64_url::encode(&signature)
        ))
    }

    /// Verify the signature and decode the claims without checking session or age.
    pub fn decode(&self, token: &str) -> Result<StateClaims, StateTokenError> {
        let (payload_b64, signature_b64) =
            token.split_once('.').ok_or(StateTokenError::Malformed)?;
        let payload = base64_url::decode(payload_b64).map_err(|_| StateTokenError::Malformed)?;
        let signature =
            base64_url::decode(signature_b64).map_err(|_| StateTokenError::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| StateTokenError::InvalidSignature)?;

        serde_json::from_slice(&payload).map_err(|_| StateTokenError::Malformed)
    }

    /// Full validation: signature, binding to `current_session`, then age.
    pub fn validate(
        &self,
        token: &str,
        current_session: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<StateClaims, StateTokenError> {
        let claims = self.decode(token)?;

        let session_matches = current_session.is_some_and(|session| {
            bool::from(session.as_bytes().ct_eq(claims.session_id.as_bytes()))
        });
        if !session_matches {
            return Err(StateTokenError::SessionMismatch);
        }

        let issued_at = claims.issued_at_time().ok_or(StateTokenError::Malformed)?;
        if issued_at > now + TimeDelta::seconds(FUTURE_SKEW_SECONDS) {
            return Err(StateTokenError::Malformed);
        }
        if now - issued_at > TimeDelta::seconds(STATE_TTL_SECONDS) {
            return Err(StateTokenError::Expired);
        }

        Ok(claims)
    }
}
