//! In-process calendar used by tests and local development.
//!
//! Behaves like the remote API where the reconciliation engine can observe
//! it: every write bumps the event's `updated` stamp, deletes leave a
//! cancelled tombstone, and failures can be injected per operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use url::Url;
use uuid::Uuid;

use super::{
    CalendarClient, CalendarError, CalendarSession, EventDraft, EventPatch, EventStatus,
    RemoteEvent, WebhookRegistration,
};

/// Lifetime given to channels opened against the in-memory calendar.
const CHANNEL_TTL_DAYS: i64 = 7;

/// Number of calls made per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub register: usize,
    pub deregister: usize,
}

/// A channel opened through [`CalendarClient::register_webhook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredChannel {
    pub channel_id: String,
    pub resource_id: String,
    pub calendar_id: String,
    pub address: String,
    pub token: String,
}

#[derive(Default)]
struct State {
    events: BTreeMap<String, RemoteEvent>,
    channels: HashMap<String, RegisteredChannel>,
    calls: CallCounts,
    next_id: u64,
    fail_list: bool,
    fail_register: bool,
    fail_deregister: bool,
    fail_create_for: HashSet<String>,
    fail_update_for: HashSet<String>,
    seen_tokens: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryCalendar {
    state: Mutex<State>,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces a remote event exactly as given.
    pub fn put_event(&self, event: RemoteEvent) {
        self.state().events.insert(event.id.clone(), event);
    }

    pub fn event(&self, id: &str) -> Option<RemoteEvent> {
        self.state().events.get(id).cloned()
    }

    pub fn events(&self) -> Vec<RemoteEvent> {
        self.state().events.values().cloned().collect()
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    pub fn channels(&self) -> Vec<RegisteredChannel> {
        self.state().channels.values().cloned().collect()
    }

    /// Access tokens presented so far, in call order.
    pub fn seen_tokens(&self) -> Vec<String> {
        self.state().seen_tokens.clone()
    }

    /// Makes every subsequent `list_events` fail with a 503.
    pub fn fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    pub fn fail_register(&self, fail: bool) {
        self.state().fail_register = fail;
    }

    pub fn fail_deregister(&self, fail: bool) {
        self.state().fail_deregister = fail;
    }

    /// Makes `create_event` fail for drafts with this summary.
    pub fn fail_create_for(&self, summary: &str) {
        self.state().fail_create_for.insert(summary.to_string());
    }

    /// Makes `update_event` fail for this event id.
    pub fn fail_update_for(&self, event_id: &str) {
        self.state().fail_update_for.insert(event_id.to_string());
    }

    fn record_token(state: &mut State, session: &CalendarSession) {
        state.seen_tokens.push(session.access_token().to_string());
    }
}

fn unavailable() -> CalendarError {
    CalendarError::Http {
        status: 503,
        body: "injected failure".into(),
    }
}

fn overlaps(event: &RemoteEvent, time_min: DateTime<Utc>, time_max: DateTime<Utc>) -> bool {
    match (event.start, event.end) {
        (Some(start), Some(end)) => start.to_utc() <= time_max && end.to_utc() >= time_min,
        // Tombstones and partial events carry no window; report them.
        _ => true,
    }
}

#[async_trait]
impl CalendarClient for InMemoryCalendar {
    async fn list_events(
        &self,
        session: &CalendarSession,
        _calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<RemoteEvent>, CalendarError> {
        let mut state = self.state();
        Self::record_token(&mut state, session);
        state.calls.list += 1;
        if state.fail_list {
            return Err(unavailable());
        }
        Ok(state
            .events
            .values()
            .filter(|event| overlaps(event, time_min, time_max))
            .cloned()
            .collect())
    }

    async fn create_event(
        &self,
        session: &CalendarSession,
        _calendar_id: &str,
        draft: &EventDraft,
    ) -> Result<RemoteEvent, CalendarError> {
        let mut state = self.state();
        Self::record_token(&mut state, session);
        state.calls.create += 1;
        if state.fail_create_for.contains(&draft.summary) {
            return Err(unavailable());
        }

        state.next_id += 1;
        let event = RemoteEvent {
            id: format!("mem-{}", state.next_id),
            status: EventStatus::Confirmed,
            summary: Some(draft.summary.clone()),
            description: draft.description.clone(),
            start: Some(draft.start),
            end: Some(draft.end),
            updated: Some(Utc::now()),
        };
        state.events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn update_event(
        &self,
        session: &CalendarSession,
        _calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<RemoteEvent, CalendarError> {
        let mut state = self.state();
        Self::record_token(&mut state, session);
        state.calls.update += 1;
        if state.fail_update_for.contains(event_id) {
            return Err(unavailable());
        }

        let event = state
            .events
            .get_mut(event_id)
            .filter(|event| !event.is_cancelled())
            .ok_or(CalendarError::NotFound)?;
        if let Some(summary) = &patch.summary {
            event.summary = Some(summary.clone());
        }
        if let Some(description) = &patch.description {
            event.description = description.clone();
        }
        if let Some(start) = patch.start {
            event.start = Some(start);
        }
        if let Some(end) = patch.end {
            event.end = Some(end);
        }
        event.updated = Some(Utc::now());
        Ok(event.clone())
    }

    async fn delete_event(
        &self,
        session: &CalendarSession,
        _calendar_id: &str,
        event_id: &str,
    ) -> Result<(), CalendarError> {
        let mut state = self.state();
        Self::record_token(&mut state, session);
        state.calls.delete += 1;

        let event = state
            .events
            .get_mut(event_id)
            .filter(|event| !event.is_cancelled())
            .ok_or(CalendarError::NotFound)?;
        event.status = EventStatus::Cancelled;
        event.updated = Some(Utc::now());
        Ok(())
    }

    async fn register_webhook(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        callback_url: &Url,
        verification_token: &str,
    ) -> Result<WebhookRegistration, CalendarError> {
        let mut state = self.state();
        Self::record_token(&mut state, session);
        state.calls.register += 1;
        if state.fail_register {
            return Err(unavailable());
        }

        let channel = RegisteredChannel {
            channel_id: Uuid::new_v4().to_string(),
            resource_id: format!("resource-{}", Uuid::new_v4().simple()),
            calendar_id: calendar_id.to_string(),
            address: callback_url.to_string(),
            token: verification_token.to_string(),
        };
        let registration = WebhookRegistration {
            channel_id: channel.channel_id.clone(),
            resource_id: channel.resource_id.clone(),
            expires_at: Some(Utc::now() + TimeDelta::days(CHANNEL_TTL_DAYS)),
        };
        state.channels.insert(channel.channel_id.clone(), channel);
        Ok(registration)
    }

    async fn deregister_webhook(
        &self,
        session: &CalendarSession,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), CalendarError> {
        let mut state = self.state();
        Self::record_token(&mut state, session);
        state.calls.deregister += 1;
        if state.fail_deregister {
            return Err(unavailable());
        }

        let known = state
            .channels
            .get(channel_id)
            .is_some_and(|channel| channel.resource_id == resource_id);
        if !known {
            return Err(CalendarError::NotFound);
        }
        state.channels.remove(channel_id);
        Ok(())
    }
}
