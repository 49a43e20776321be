//! Calendar entry entity: an internal scheduling record.
//!
//! Entries are either authored internally (`origin = internal`) and exported,
//! or materialized from a remote event by import (`origin = external`). The
//! `external_*` columns carry provenance and drive loop prevention.

use sea_orm::entity::prelude::*;

/// Where an entry was first authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum EntryOrigin {
    #[sea_orm(string_value = "internal")]
    Internal,
    #[sea_orm(string_value = "external")]
    External,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "calendar_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub author_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub start_at: DateTimeUtc,
    pub end_at: DateTimeUtc,
    pub all_day: bool,
    pub origin: EntryOrigin,

    /// Provider the external id belongs to
    pub external_provider: Option<String>,
    /// Remote event id; unique within (tenant, provider)
    pub external_id: Option<String>,
    /// Remote last-modified time as last observed or stamped by this engine
    pub external_updated_at: Option<DateTimeUtc>,

    /// Soft-delete marker set by record CRUD or by a cancelled remote event
    pub deleted_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,
    /// Internal last-modified time
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
