//! Calendar entry repository: the scheduling-record store used by reconciliation.
//!
//! All queries are tenant-scoped. Time-window filters run in SQL; the
//! column-to-column loop-prevention comparisons are left to the caller (see
//! [`crate::sync::needs_export`]).

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::models::calendar_entry::{self, Entity as CalendarEntry, EntryOrigin};

/// Content fields shared by internal authoring and remote imports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryContent {
    pub title: String,
    pub description: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub all_day: bool,
}

/// Provenance of an entry materialized from a remote event.
#[derive(Debug, Clone)]
pub struct ExternalRef {
    pub provider: String,
    pub external_id: String,
    pub external_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EntryRepository {
    db: Arc<DatabaseConnection>,
}

impl EntryRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<calendar_entry::Model>> {
        CalendarEntry::find()
            .filter(calendar_entry::Column::TenantId.eq(tenant_id))
            .filter(calendar_entry::Column::Id.eq(id))
            .one(self.db.as_ref())
            .await
            .context("loading calendar entry")
    }

    /// Looks up the entry linked to a remote event, deleted or not.
    pub async fn find_by_external_id(
        &self,
        tenant_id: Uuid,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<calendar_entry::Model>> {
        CalendarEntry::find()
            .filter(calendar_entry::Column::TenantId.eq(tenant_id))
            .filter(calendar_entry::Column::ExternalProvider.eq(provider))
            .filter(calendar_entry::Column::ExternalId.eq(external_id))
            .one(self.db.as_ref())
            .await
            .context("loading calendar entry by external id")
    }

    /// Lists an author's live entries in a tenant, oldest first.
    pub async fn list_for_author(
        &self,
        tenant_id: Uuid,
        author_id: Uuid,
    ) -> Result<Vec<calendar_entry::Model>> {
        CalendarEntry::find()
            .filter(calendar_entry::Column::TenantId.eq(tenant_id))
            .filter(calendar_entry::Column::AuthorId.eq(author_id))
            .filter(calendar_entry::Column::DeletedAt.is_null())
            .order_by_asc(calendar_entry::Column::StartAt)
            .all(self.db.as_ref())
            .await
            .context("listing calendar entries")
    }

    /// Creates a natively authored entry.
    pub async fn create_internal(
        &self,
        tenant_id: Uuid,
        author_id: Uuid,
        content: EntryContent,
    ) -> Result<calendar_entry::Model> {
        let now = Utc::now();
        self.insert(tenant_id, author_id, content, EntryOrigin::Internal, None, now)
            .await
    }

    /// Creates an entry materialized from a remote event.
    pub async fn create_imported(
        &self,
        tenant_id: Uuid,
        author_id: Uuid,
        content: EntryContent,
        external: ExternalRef,
    ) -> Result<calendar_entry::Model> {
        let now = Utc::now();
        self.insert(
            tenant_id,
            author_id,
            content,
            EntryOrigin::External,
            Some(external),
            now,
        )
        .await
    }

    /// Edits an entry's content as ordinary record CRUD does, bumping `updated_at`.
    pub async fn update_content(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        content: EntryContent,
    ) -> Result<()> {
        let now = Utc::now();
        let patch = calendar_entry::ActiveModel {
            title: Set(content.title),
            description: Set(content.description),
            start_at: Set(content.start_at),
            end_at: Set(content.end_at),
            all_day: Set(content.all_day),
            updated_at: Set(now),
            ..Default::default()
        };
        self.apply(tenant_id, id, patch, "updating entry content")
            .await
    }

    /// Applies a newer remote version. `updated_at` takes the remote modification
    /// time so the change is not mistaken for an internal edit awaiting export.
    pub async fn apply_remote_update(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        content: EntryContent,
        external_updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let patch = calendar_entry::ActiveModel {
            title: Set(content.title),
            description: Set(content.description),
            start_at: Set(content.start_at),
            end_at: Set(content.end_at),
            all_day: Set(content.all_day),
            external_updated_at: Set(Some(external_updated_at)),
            updated_at: Set(external_updated_at),
            ..Default::default()
        };
        self.apply(tenant_id, id, patch, "applying remote update")
            .await
    }

    /// Soft-deletes an entry.
    pub async fn soft_delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let now = Utc::now();
        let patch = calendar_entry::ActiveModel {
            deleted_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        self.apply(tenant_id, id, patch, "soft-deleting entry")
            .await
    }

    /// Soft-deletes an entry whose remote event was cancelled.
    ///
    /// `stamp` must not precede the deletion time, otherwise the export pass
    /// would try to propagate the deletion back to the remote side.
    pub async fn soft_delete_from_remote(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        stamp: DateTime<Utc>,
    ) -> Result<()> {
        let patch = calendar_entry::ActiveModel {
            deleted_at: Set(Some(stamp)),
            external_updated_at: Set(Some(stamp)),
            ..Default::default()
        };
        self.apply(tenant_id, id, patch, "applying remote deletion")
            .await
    }

    /// Live internal entries by `author_id` overlapping `[window_start, window_end]`.
    ///
    /// Callers still filter with [`crate::sync::needs_export`].
    pub async fn export_candidates(
        &self,
        tenant_id: Uuid,
        author_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<calendar_entry::Model>> {
        CalendarEntry::find()
            .filter(calendar_entry::Column::TenantId.eq(tenant_id))
            .filter(calendar_entry::Column::AuthorId.eq(author_id))
            .filter(calendar_entry::Column::Origin.eq(EntryOrigin::Internal))
            .filter(calendar_entry::Column::DeletedAt.is_null())
            .filter(calendar_entry::Column::StartAt.lte(window_end))
            .filter(calendar_entry::Column::EndAt.gte(window_start))
            .order_by_asc(calendar_entry::Column::StartAt)
            .all(self.db.as_ref())
            .await
            .context("loading export candidates")
    }

    /// Soft-deleted internal entries by `author_id` that still point at a remote event.
    pub async fn deleted_with_external_id(
        &self,
        tenant_id: Uuid,
        author_id: Uuid,
        provider: &str,
    ) -> Result<Vec<calendar_entry::Model>> {
        CalendarEntry::find()
            .filter(calendar_entry::Column::TenantId.eq(tenant_id))
            .filter(calendar_entry::Column::AuthorId.eq(author_id))
            .filter(calendar_entry::Column::Origin.eq(EntryOrigin::Internal))
            .filter(calendar_entry::Column::DeletedAt.is_not_null())
            .filter(calendar_entry::Column::ExternalProvider.eq(provider))
            .filter(calendar_entry::Column::ExternalId.is_not_null())
            .all(self.db.as_ref())
            .await
            .context("loading deleted entries awaiting propagation")
    }

    /// Links an entry to its remote event and stamps the export time.
    /// `updated_at` is left untouched so the entry stops qualifying for export.
    pub async fn mark_exported(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        provider: &str,
        external_id: &str,
        stamp: DateTime<Utc>,
    ) -> Result<()> {
        let patch = calendar_entry::ActiveModel {
            external_provider: Set(Some(provider.to_string())),
            external_id: Set(Some(external_id.to_string())),
            external_updated_at: Set(Some(stamp)),
            ..Default::default()
        };
        self.apply(tenant_id, id, patch, "marking entry exported")
            .await
    }

    /// Stamps an entry whose deletion has been propagated to the remote side.
    pub async fn mark_deletion_propagated(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        stamp: DateTime<Utc>,
    ) -> Result<()> {
        let patch = calendar_entry::ActiveModel {
            external_updated_at: Set(Some(stamp)),
            ..Default::default()
        };
        self.apply(tenant_id, id, patch, "marking deletion propagated")
            .await
    }

    async fn insert(
        &self,
        tenant_id: Uuid,
        author_id: Uuid,
        content: EntryContent,
        origin: EntryOrigin,
        external: Option<ExternalRef>,
        now: DateTime<Utc>,
    ) -> Result<calendar_entry::Model> {
        let (external_provider, external_id, external_updated_at) = match external {
            Some(external) => (
                Some(external.provider),
                Some(external.external_id),
                external.external_updated_at,
            ),
            None => (None, None, None),
        };

        let active = calendar_entry::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            author_id: Set(author_id),
            title: Set(content.title),
            description: Set(content.description),
            start_at: Set(content.start_at),
            end_at: Set(content.end_at),
            all_day: Set(content.all_day),
            origin: Set(origin),
            external_provider: Set(external_provider),
            external_id: Set(external_id),
            external_updated_at: Set(external_updated_at),
            deleted_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        active
            .insert(self.db.as_ref())
            .await
            .context("inserting calendar entry")
    }

    async fn apply(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        patch: calendar_entry::ActiveModel,
        action: &'static str,
    ) -> Result<()> {
        let result = CalendarEntry::update_many()
            .set(patch)
            .filter(calendar_entry::Column::TenantId.eq(tenant_id))
            .filter(calendar_entry::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .context(action)?;

        if result.rows_affected == 0 {
            return Err(anyhow!("{}: entry '{}' not found for tenant", action, id));
        }
        Ok(())
    }
}
