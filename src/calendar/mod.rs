//! # External Calendar Client
//!
//! A narrow, typed interface over a remote calendar API. The reconciliation
//! engine and the webhook layer only ever see [`CalendarClient`]; transport
//! details live in the adapters:
//!
//! - [`google::GoogleCalendarClient`]: Google Calendar v3 over `reqwest`
//! - [`memory::InMemoryCalendar`]: an in-process calendar for tests and local runs

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use thiserror::Error;
use url::Url;

pub mod google;
pub mod memory;

pub use google::GoogleCalendarClient;
pub use memory::InMemoryCalendar;

/// Provider name stored on connections and entries.
pub const GOOGLE_PROVIDER: &str = "google";

/// The calendar targeted when a connection does not name one.
pub const PRIMARY_CALENDAR: &str = "primary";

/// An authenticated session against the remote API.
///
/// Built per operation from a live access token; never cached globally.
#[derive(Clone)]
pub struct CalendarSession {
    access_token: String,
}

impl CalendarSession {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for CalendarSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CalendarSession([REDACTED])")
    }
}

/// Start or end of a remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTime {
    /// A timed boundary
    DateTime(DateTime<Utc>),
    /// An all-day boundary
    Date(NaiveDate),
}

impl EventTime {
    /// The boundary as an instant. Dates map to midnight UTC.
    pub fn to_utc(self) -> DateTime<Utc> {
        match self {
            EventTime::DateTime(at) => at,
            EventTime::Date(date) => Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)),
        }
    }

    pub fn is_all_day(self) -> bool {
        matches!(self, EventTime::Date(_))
    }

    /// Builds a boundary for an entry, date-only when `all_day` is set.
    pub fn for_entry(at: DateTime<Utc>, all_day: bool) -> Self {
        if all_day {
            EventTime::Date(at.date_naive())
        } else {
            EventTime::DateTime(at)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("cancelled") => EventStatus::Cancelled,
            Some("tentative") => EventStatus::Tentative,
            _ => EventStatus::Confirmed,
        }
    }
}

/// An event as reported by the remote calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub id: String,
    pub status: EventStatus,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    /// Remote last-modified time
    pub updated: Option<DateTime<Utc>>,
}

impl RemoteEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }
}

/// Fields for a new remote event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub summary: String,
    pub description: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
}

/// Partial update of a remote event; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPatch {
    pub summary: Option<String>,
    /// `Some(None)` clears the remote description.
    pub description: Option<Option<String>>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
}

impl From<EventDraft> for EventPatch {
    fn from(draft: EventDraft) -> Self {
        Self {
            summary: Some(draft.summary),
            description: Some(draft.description),
            start: Some(draft.start),
            end: Some(draft.end),
        }
    }
}

/// A push-notification channel accepted by the remote calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRegistration {
    pub channel_id: String,
    pub resource_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Remote calendar errors. Response bodies are kept for logs but never displayed.
#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("remote calendar rejected the credentials")]
    Unauthorized,
    #[error("remote resource not found")]
    NotFound,
    #[error("rate limited by remote calendar{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<u64> },
    #[error("remote calendar returned status {status}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request to remote calendar timed out")]
    Timeout,
    #[error("unexpected response from remote calendar: {0}")]
    MalformedResponse(String),
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    retry_after
        .map(|seconds| format!(", retry after {}s", seconds))
        .unwrap_or_default()
}

impl CalendarError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CalendarError::NotFound)
    }
}

impl From<reqwest::Error> for CalendarError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CalendarError::Timeout
        } else if err.is_decode() {
            CalendarError::MalformedResponse(err.to_string())
        } else {
            // Strip the URL: it can carry calendar ids.
            CalendarError::Network(err.without_url().to_string())
        }
    }
}

/// Typed operations against a remote calendar.
///
/// Errors propagate unwrapped; callers decide whether a failure is per-item
/// or aborts the pass.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// All events (including cancelled ones) overlapping `[time_min, time_max]`.
    async fn list_events(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<RemoteEvent>, CalendarError>;

    async fn create_event(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        draft: &EventDraft,
    ) -> Result<RemoteEvent, CalendarError>;

    async fn update_event(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<RemoteEvent, CalendarError>;

    async fn delete_event(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), CalendarError>;

    /// Opens a push channel delivering change notifications to `callback_url`.
    async fn register_webhook(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        callback_url: &Url,
        verification_token: &str,
    ) -> Result<WebhookRegistration, CalendarError>;

    async fn deregister_webhook(
        &self,
        session: &CalendarSession,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), CalendarError>;
}
