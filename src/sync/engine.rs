use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use scopeguard::ScopeGuard;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    SyncDirection, SyncError, SyncReport, needs_deletion_propagation, needs_export, needs_import,
    sync_window,
};
use crate::calendar::{
    CalendarClient, CalendarError, CalendarSession, EventDraft, EventTime, GOOGLE_PROVIDER,
    RemoteEvent,
};
use crate::models::{calendar_connection, calendar_entry};
use crate::oauth::TokenManager;
use crate::repositories::{ConnectionRepository, EntryContent, EntryRepository, ExternalRef};

/// Title given to imported events that have no summary.
const UNTITLED: &str = "(untitled)";

enum ImportOutcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
    Skipped,
}

impl ImportOutcome {
    fn label(&self) -> &'static str {
        match self {
            ImportOutcome::Created => "created",
            ImportOutcome::Updated => "updated",
            ImportOutcome::Deleted => "deleted",
            ImportOutcome::Unchanged => "unchanged",
            ImportOutcome::Skipped => "skipped",
        }
    }
}

/// The reconciliation engine.
///
/// Holds no lock across remote or storage calls. The only shared state is the
/// set of connections currently being reconciled.
pub struct SyncEngine {
    calendar: Arc<dyn CalendarClient>,
    connections: ConnectionRepository,
    entries: EntryRepository,
    tokens: TokenManager,
    propagate_deletions: bool,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl SyncEngine {
    pub fn new(
        calendar: Arc<dyn CalendarClient>,
        connections: ConnectionRepository,
        entries: EntryRepository,
        tokens: TokenManager,
        propagate_deletions: bool,
    ) -> Self {
        Self {
            calendar,
            connections,
            entries,
            tokens,
            propagate_deletions,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `connection_id` as syncing until the returned guard drops.
    fn claim(&self, connection_id: Uuid) -> Option<ScopeGuard<Uuid, impl FnOnce(Uuid) + '_>> {
        if !self.in_flight().insert(connection_id) {
            return None;
        }
        Some(scopeguard::guard(connection_id, move |id| {
            self.in_flight().remove(&id);
        }))
    }

    /// Runs the requested passes for `connection`.
    ///
    /// Import completes before export starts. Per-item failures are collected
    /// in the report; a pass-level failure (token, listing, store) is appended
    /// to the report and moves the connection to `error`.
    #[instrument(
        skip_all,
        fields(
            connection_id = %connection.id,
            tenant_id = %connection.tenant_id,
            direction = direction.as_str()
        )
    )]
    pub async fn sync(
        &self,
        connection: &calendar_connection::Model,
        direction: SyncDirection,
    ) -> SyncReport {
        let Some(_claim) = self.claim(connection.id) else {
            info!("Reconciliation already running for connection; skipping");
            counter!("calendar_sync_runs_total", "direction" => direction.as_str(), "outcome" => "skipped")
                .increment(1);
            return SyncReport::skipped();
        };

        let started = Instant::now();
        let mut connection = connection.clone();
        let mut report = SyncReport::default();

        let outcome = self
            .run_passes(&mut connection, direction, &mut report)
            .await;

        let result_label = match outcome {
            Ok(()) => {
                if let Err(err) = self
                    .connections
                    .record_sync_success(connection.tenant_id, connection.id, Utc::now())
                    .await
                {
                    warn!(error = %err, "Failed to record sync success");
                }
                "success"
            }
            Err(err) => {
                let message = err.public_message();
                error!(error = %err, "Reconciliation pass failed");
                if let Err(store_err) = self
                    .connections
                    .record_sync_failure(connection.tenant_id, connection.id, &message)
                    .await
                {
                    error!(error = %store_err, "Failed to record sync failure");
                }
                report.errors.push(message);
                "failure"
            }
        };

        counter!("calendar_sync_runs_total", "direction" => direction.as_str(), "outcome" => result_label)
            .increment(1);
        histogram!("calendar_sync_duration_seconds", "direction" => direction.as_str())
            .record(started.elapsed().as_secs_f64());

        info!(
            imported = report.imported,
            exported = report.exported,
            deleted = report.deleted,
            errors = report.errors.len(),
            outcome = result_label,
            "Reconciliation finished"
        );
        report
    }

    async fn run_passes(
        &self,
        connection: &mut calendar_connection::Model,
        direction: SyncDirection,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let access_token = self.tokens.live_access_token(connection).await?;
        let session = CalendarSession::new(access_token);
        let (window_start, window_end) = sync_window(
            Utc::now(),
            connection.sync_range_start_days,
            connection.sync_range_end_days,
        );

        if direction.includes_import() {
            self.import_pass(connection, &session, window_start, window_end, report)
                .await?;
        }
        if direction.includes_export() {
            self.export_pass(connection, &session, window_start, window_end, report)
                .await?;
        }
        Ok(())
    }

    async fn import_pass(
        &self,
        connection: &calendar_connection::Model,
        session: &CalendarSession,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let events = self
            .calendar
            .list_events(session, &connection.calendar_id, window_start, window_end)
            .await
            .map_err(SyncError::ListEvents)?;
        debug!(count = events.len(), "Fetched remote events");

        for event in &events {
            match self.import_event(connection, event).await {
                Ok(outcome) => {
                    match outcome {
                        ImportOutcome::Created | ImportOutcome::Updated => report.imported += 1,
                        ImportOutcome::Deleted => report.deleted += 1,
                        ImportOutcome::Unchanged | ImportOutcome::Skipped => {}
                    }
                    counter!("calendar_sync_items_total", "pass" => "import", "result" => outcome.label())
                        .increment(1);
                }
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "Failed to import remote event");
                    counter!("calendar_sync_items_total", "pass" => "import", "result" => "failed")
                        .increment(1);
                    report.errors.push(format!("import {}: {}", event.id, err));
                }
            }
        }
        Ok(())
    }

    async fn import_event(
        &self,
        connection: &calendar_connection::Model,
        event: &RemoteEvent,
    ) -> anyhow::Result<ImportOutcome> {
        let existing = self
            .entries
            .find_by_external_id(connection.tenant_id, GOOGLE_PROVIDER, &event.id)
            .await?;

        if event.is_cancelled() {
            return match existing {
                Some(entry)
                    if entry.deleted_at.is_none()
                        && needs_import(entry.external_updated_at, event.updated) =>
                {
                    let stamp = event.updated.map_or(Utc::now(), |updated| updated.max(Utc::now()));
                    self.entries
                        .soft_delete_from_remote(connection.tenant_id, entry.id, stamp)
                        .await?;
                    Ok(ImportOutcome::Deleted)
                }
                _ => Ok(ImportOutcome::Unchanged),
            };
        }

        let (Some(start), Some(end)) = (event.start, event.end) else {
            debug!(event_id = %event.id, "Skipping remote event without start and end");
            return Ok(ImportOutcome::Skipped);
        };
        let content = EntryContent {
            title: event
                .summary
                .clone()
                .unwrap_or_else(|| UNTITLED.to_string()),
            description: event.description.clone(),
            start_at: start.to_utc(),
            end_at: end.to_utc(),
            all_day: start.is_all_day(),
        };

        match existing {
            None => {
                self.entries
                    .create_imported(
                        connection.tenant_id,
                        connection.principal_id,
                        content,
                        ExternalRef {
                            provider: GOOGLE_PROVIDER.to_string(),
                            external_id: event.id.clone(),
                            external_updated_at: event.updated,
                        },
                    )
                    .await?;
                Ok(ImportOutcome::Created)
            }
            // Local deletion wins; the export pass propagates it when enabled.
            Some(entry) if entry.deleted_at.is_some() => Ok(ImportOutcome::Unchanged),
            Some(entry) => match event
                .updated
                .filter(|_| needs_import(entry.external_updated_at, event.updated))
            {
                Some(updated) => {
                    self.entries
                        .apply_remote_update(connection.tenant_id, entry.id, content, updated)
                        .await?;
                    Ok(ImportOutcome::Updated)
                }
                None => Ok(ImportOutcome::Unchanged),
            },
        }
    }

    async fn export_pass(
        &self,
        connection: &calendar_connection::Model,
        session: &CalendarSession,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let candidates = self
            .entries
            .export_candidates(
                connection.tenant_id,
                connection.principal_id,
                window_start,
                window_end,
            )
            .await
            .map_err(SyncError::Store)?;

        for entry in candidates.iter().filter(|entry| needs_export(entry)) {
            match self.export_entry(connection, session, entry).await {
                Ok(()) => {
                    report.exported += 1;
                    counter!("calendar_sync_items_total", "pass" => "export", "result" => "exported")
                        .increment(1);
                }
                Err(err) => {
                    warn!(entry_id = %entry.id, error = %err, "Failed to export entry");
                    counter!("calendar_sync_items_total", "pass" => "export", "result" => "failed")
                        .increment(1);
                    report.errors.push(format!("export {}: {}", entry.id, err));
                }
            }
        }

        if self.propagate_deletions {
            self.propagate_local_deletions(connection, session, report)
                .await?;
        }
        Ok(())
    }

    async fn export_entry(
        &self,
        connection: &calendar_connection::Model,
        session: &CalendarSession,
        entry: &calendar_entry::Model,
    ) -> anyhow::Result<()> {
        let draft = EventDraft {
            summary: entry.title.clone(),
            description: entry.description.clone(),
            start: EventTime::for_entry(entry.start_at, entry.all_day),
            end: EventTime::for_entry(entry.end_at, entry.all_day),
        };

        let remote = match entry.external_id.as_deref() {
            None => {
                self.calendar
                    .create_event(session, &connection.calendar_id, &draft)
                    .await?
            }
            Some(external_id) => {
                self.calendar
                    .update_event(session, &connection.calendar_id, external_id, &draft.into())
                    .await?
            }
        };

        // Never stamp below the remote modification time, or the next import
        // would treat our own write as a newer remote change.
        let now = Utc::now();
        let stamp = remote.updated.map_or(now, |updated| updated.max(now));
        self.entries
            .mark_exported(
                connection.tenant_id,
                entry.id,
                GOOGLE_PROVIDER,
                &remote.id,
                stamp,
            )
            .await?;
        Ok(())
    }

    async fn propagate_local_deletions(
        &self,
        connection: &calendar_connection::Model,
        session: &CalendarSession,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let deleted = self
            .entries
            .deleted_with_external_id(connection.tenant_id, connection.principal_id, GOOGLE_PROVIDER)
            .await
            .map_err(SyncError::Store)?;

        for entry in deleted.iter().filter(|entry| needs_deletion_propagation(entry)) {
            let Some(external_id) = entry.external_id.as_deref() else {
                continue;
            };
            let outcome = match self
                .calendar
                .delete_event(session, &connection.calendar_id, external_id)
                .await
            {
                Ok(()) | Err(CalendarError::NotFound) => self
                    .entries
                    .mark_deletion_propagated(connection.tenant_id, entry.id, Utc::now())
                    .await,
                Err(err) => Err(err.into()),
            };

            match outcome {
                Ok(()) => {
                    report.deleted += 1;
                    counter!("calendar_sync_items_total", "pass" => "export", "result" => "deleted")
                        .increment(1);
                }
                Err(err) => {
                    warn!(entry_id = %entry.id, error = %err, "Failed to propagate deletion");
                    counter!("calendar_sync_items_total", "pass" => "export", "result" => "failed")
                        .increment(1);
                    report.errors.push(format!("delete {}: {}", entry.id, err));
                }
            }
        }
        Ok(())
    }
}
