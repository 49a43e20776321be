//! Calendar connection entity.
//!
//! One row per (tenant, principal, provider). Tokens are stored as Credential
//! Vault ciphertext; the push-notification channel fields are all-or-nothing.

use sea_orm::entity::prelude::*;

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum ConnectionStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "error")]
    Error,
    #[sea_orm(string_value = "disconnected")]
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "calendar_connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning tenant; every lookup is filtered by it
    pub tenant_id: Uuid,

    /// Principal (user) that authorized the connection
    pub principal_id: Uuid,

    /// Provider slug, e.g. `google`
    pub provider: String,

    /// Remote calendar identifier, `primary` unless configured otherwise
    pub calendar_id: String,

    pub access_token_ciphertext: String,
    pub refresh_token_ciphertext: String,
    pub token_expires_at: DateTimeUtc,

    pub webhook_channel_id: Option<String>,
    /// Remote resource id returned at registration, needed to stop the channel
    pub webhook_resource_id: Option<String>,
    pub webhook_token: Option<String>,
    pub webhook_expires_at: Option<DateTimeUtc>,

    /// Sync window offsets in days relative to now
    pub sync_range_start_days: i32,
    pub sync_range_end_days: i32,

    pub last_synced_at: Option<DateTimeUtc>,
    /// Sanitized message of the last pass-level failure
    pub last_error: Option<String>,
    pub status: ConnectionStatus,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether a push-notification channel is currently recorded.
    pub fn has_webhook_channel(&self) -> bool {
        self.webhook_channel_id.is_some()
    }
}
