//! # Reconciliation
//!
//! Keeps a connection's calendar entries and its remote calendar consistent.
//! One [`SyncEngine::sync`] call runs the import pass (remote to internal)
//! and/or the export pass (internal to remote).
//!
//! Both passes compare timestamps instead of diffing content. The two rules
//! that make this loop-safe are the named predicates [`needs_import`] and
//! [`needs_export`]:
//!
//! - an import only applies a remote event whose last-modified time strictly
//!   advances past the stored `external_updated_at`;
//! - an export only selects an internal entry whose `updated_at` is strictly
//!   newer than its `external_updated_at`, and stamps that field afterwards.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::calendar::CalendarError;
use crate::models::calendar_entry::{self, EntryOrigin};
use crate::oauth::TokenError;

mod engine;

pub use engine::SyncEngine;

/// Which passes a reconciliation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Import,
    Export,
    Both,
}

impl SyncDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncDirection::Import => "import",
            SyncDirection::Export => "export",
            SyncDirection::Both => "both",
        }
    }

    pub fn includes_import(self) -> bool {
        matches!(self, SyncDirection::Import | SyncDirection::Both)
    }

    pub fn includes_export(self) -> bool {
        matches!(self, SyncDirection::Export | SyncDirection::Both)
    }
}

/// Outcome of one reconciliation call. Never an error: pass-level failures
/// land in `errors` and on the connection's status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SyncReport {
    /// Entries created or updated from remote events
    pub imported: usize,
    /// Entries created or updated on the remote calendar
    pub exported: usize,
    /// Deletions applied in either direction
    #[serde(skip_serializing_if = "is_zero")]
    pub deleted: usize,
    pub errors: Vec<String>,
    /// Set when another reconciliation for the connection was already running
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl SyncReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A failure that aborts a whole pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not obtain a live access token: {0}")]
    Token(#[from] TokenError),
    #[error("listing remote events failed: {0}")]
    ListEvents(CalendarError),
    #[error("calendar entry store failed: {0}")]
    Store(anyhow::Error),
}

impl SyncError {
    /// Message safe to store on the connection and return to callers.
    pub fn public_message(&self) -> String {
        match self {
            SyncError::Token(TokenError::Refresh(_)) => {
                "access token refresh failed; the calendar may need to be reconnected".to_string()
            }
            SyncError::Token(TokenError::Vault(_)) => "stored credentials are unreadable".to_string(),
            SyncError::Token(TokenError::Persistence(_)) => {
                "failed to store refreshed credentials".to_string()
            }
            SyncError::ListEvents(err) => format!("failed to list remote events: {}", err),
            SyncError::Store(_) => "failed to read or write calendar entries".to_string(),
        }
    }
}

/// `[now + start_days, now + end_days]`.
pub fn sync_window(
    now: DateTime<Utc>,
    start_days: i32,
    end_days: i32,
) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        now + TimeDelta::days(i64::from(start_days)),
        now + TimeDelta::days(i64::from(end_days)),
    )
}

/// Import stale-check: apply a remote event only if its last-modified time
/// strictly advances past the stored one.
///
/// A remote event without a last-modified time is never re-applied.
pub fn needs_import(stored: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>>) -> bool {
    match (stored, remote) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(stored), Some(remote)) => remote > stored,
    }
}

/// Export selection: a live internal entry that was never exported, or that
/// was modified internally after its last export stamp.
pub fn needs_export(entry: &calendar_entry::Model) -> bool {
    if entry.deleted_at.is_some() || entry.origin != EntryOrigin::Internal {
        return false;
    }
    match (&entry.external_id, entry.external_updated_at) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(_), Some(stamp)) => entry.updated_at > stamp,
    }
}

/// A soft-deleted exported entry whose deletion has not reached the remote side.
pub fn needs_deletion_propagation(entry: &calendar_entry::Model) -> bool {
    if entry.origin != EntryOrigin::Internal || entry.external_id.is_none() {
        return false;
    }
    match (entry.deleted_at, entry.external_updated_at) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(deleted), Some(stamp)) => deleted > stamp,
    }
}
