//! Calendar connection repository.
//!
//! Every method except [`ConnectionRepository::find_by_webhook_channel`] is
//! scoped by tenant id. Mutations are single-statement field updates filtered
//! by `(tenant_id, id)`, so concurrent callers never interleave a
//! read-modify-write on the same row.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use uuid::Uuid;

use crate::models::calendar_connection::{self, ConnectionStatus, Entity as CalendarConnection};

/// Values needed to create or refresh a connection after a successful OAuth callback.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub tenant_id: Uuid,
    pub principal_id: Uuid,
    pub provider: String,
    pub calendar_id: String,
    pub access_token_ciphertext: String,
    pub refresh_token_ciphertext: String,
    pub token_expires_at: DateTime<Utc>,
    pub sync_range_start_days: i32,
    pub sync_range_end_days: i32,
}

/// A registered push-notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookChannel {
    pub channel_id: String,
    pub resource_id: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Repository for calendar connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    db: Arc<DatabaseConnection>,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds a connection by id within a tenant.
    pub async fn find_by_id(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<calendar_connection::Model>> {
        CalendarConnection::find()
            .filter(calendar_connection::Column::TenantId.eq(tenant_id))
            .filter(calendar_connection::Column::Id.eq(id))
            .one(self.db.as_ref())
            .await
            .context("loading calendar connection by id")
    }

    /// Finds the connection a principal holds for `provider`.
    pub async fn find_for_principal(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        provider: &str,
    ) -> Result<Option<calendar_connection::Model>> {
        CalendarConnection::find()
            .filter(calendar_connection::Column::TenantId.eq(tenant_id))
            .filter(calendar_connection::Column::PrincipalId.eq(principal_id))
            .filter(calendar_connection::Column::Provider.eq(provider))
            .one(self.db.as_ref())
            .await
            .context("loading calendar connection for principal")
    }

    /// Finds the connection owning a webhook channel.
    ///
    /// Inbound notifications carry no tenant context. The caller must
    /// authenticate the result against the channel token before acting on it.
    pub async fn find_by_webhook_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<calendar_connection::Model>> {
        CalendarConnection::find()
            .filter(calendar_connection::Column::WebhookChannelId.eq(channel_id))
            .one(self.db.as_ref())
            .await
            .context("loading calendar connection by webhook channel")
    }

    /// Creates the connection, or refreshes credentials on the existing one for
    /// the same (tenant, principal, provider).
    pub async fn upsert_authorized(
        &self,
        new: NewConnection,
    ) -> Result<calendar_connection::Model> {
        let now = Utc::now();
        let existing = self
            .find_for_principal(new.tenant_id, new.principal_id, &new.provider)
            .await?;

        match existing {
            Some(existing) => {
                let mut active: calendar_connection::ActiveModel = existing.into();
                active.access_token_ciphertext = Set(new.access_token_ciphertext);
                active.refresh_token_ciphertext = Set(new.refresh_token_ciphertext);
                active.token_expires_at = Set(new.token_expires_at);
                active.status = Set(ConnectionStatus::Active);
                active.last_error = Set(None);
                active.updated_at = Set(now);
                active
                    .update(self.db.as_ref())
                    .await
                    .context("updating calendar connection credentials")
            }
            None => {
                let active = calendar_connection::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    tenant_id: Set(new.tenant_id),
                    principal_id: Set(new.principal_id),
                    provider: Set(new.provider),
                    calendar_id: Set(new.calendar_id),
                    access_token_ciphertext: Set(new.access_token_ciphertext),
                    refresh_token_ciphertext: Set(new.refresh_token_ciphertext),
                    token_expires_at: Set(new.token_expires_at),
                    webhook_channel_id: Set(None),
                    webhook_resource_id: Set(None),
                    webhook_token: Set(None),
                    webhook_expires_at: Set(None),
                    sync_range_start_days: Set(new.sync_range_start_days),
                    sync_range_end_days: Set(new.sync_range_end_days),
                    last_synced_at: Set(None),
                    last_error: Set(None),
                    status: Set(ConnectionStatus::Active),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                active
                    .insert(self.db.as_ref())
                    .await
                    .context("inserting calendar connection")
            }
        }
    }

    /// Persists a refreshed access token (and a rotated refresh token, if any).
    pub async fn update_tokens(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        access_token_ciphertext: String,
        refresh_token_ciphertext: Option<String>,
        token_expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut patch = calendar_connection::ActiveModel {
            access_token_ciphertext: Set(access_token_ciphertext),
            token_expires_at: Set(token_expires_at),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        if let Some(refresh) = refresh_token_ciphertext {
            patch.refresh_token_ciphertext = Set(refresh);
        }
        self.apply(tenant_id, id, patch, "updating connection tokens")
            .await
    }

    /// Marks a reconciliation pass as successful.
    pub async fn record_sync_success(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let patch = calendar_connection::ActiveModel {
            status: Set(ConnectionStatus::Active),
            last_synced_at: Set(Some(at)),
            last_error: Set(None),
            updated_at: Set(at),
            ..Default::default()
        };
        self.apply(tenant_id, id, patch, "recording sync success")
            .await
    }

    /// Marks a reconciliation pass as failed. The connection is kept.
    pub async fn record_sync_failure(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        message: &str,
    ) -> Result<()> {
        let patch = calendar_connection::ActiveModel {
            status: Set(ConnectionStatus::Error),
            last_error: Set(Some(message.to_string())),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        self.apply(tenant_id, id, patch, "recording sync failure")
            .await
    }

    /// Records a newly registered push-notification channel.
    pub async fn set_webhook_channel(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        channel: &WebhookChannel,
    ) -> Result<()> {
        let patch = calendar_connection::ActiveModel {
            webhook_channel_id: Set(Some(channel.channel_id.clone())),
            webhook_resource_id: Set(Some(channel.resource_id.clone())),
            webhook_token: Set(Some(channel.token.clone())),
            webhook_expires_at: Set(channel.expires_at),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        self.apply(tenant_id, id, patch, "storing webhook channel")
            .await
    }

    /// Clears all channel fields, optionally moving the connection to `status`.
    pub async fn clear_webhook_channel(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: Option<ConnectionStatus>,
    ) -> Result<()> {
        let mut patch = calendar_connection::ActiveModel {
            webhook_channel_id: Set(None),
            webhook_resource_id: Set(None),
            webhook_token: Set(None),
            webhook_expires_at: Set(None),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        if let Some(status) = status {
            patch.status = Set(status);
        }
        self.apply(tenant_id, id, patch, "clearing webhook channel")
            .await
    }

    /// Hard-deletes a connection within a tenant.
    pub async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let result = CalendarConnection::delete_many()
            .filter(calendar_connection::Column::TenantId.eq(tenant_id))
            .filter(calendar_connection::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .context("deleting calendar connection")?;

        if result.rows_affected == 0 {
            tracing::warn!(
                tenant_id = %tenant_id,
                connection_id = %id,
                "Attempted to delete connection not found for tenant"
            );
            return Err(anyhow!("connection '{}' not found for tenant", id));
        }
        Ok(())
    }

    async fn apply(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        patch: calendar_connection::ActiveModel,
        action: &'static str,
    ) -> Result<()> {
        let result = CalendarConnection::update_many()
            .set(patch)
            .filter(calendar_connection::Column::TenantId.eq(tenant_id))
            .filter(calendar_connection::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .context(action)?;

        if result.rows_affected == 0 {
            return Err(anyhow!("{}: connection '{}' not found for tenant", action, id));
        }
        Ok(())
    }
}
