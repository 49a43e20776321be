//! Google Calendar v3 adapter.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::error::truncate_body;

use super::{
    CalendarClient, CalendarError, CalendarSession, EventDraft, EventPatch, EventStatus,
    EventTime, RemoteEvent, WebhookRegistration,
};

/// Page size requested from the events endpoint (the API maximum is 2500).
const PAGE_SIZE: &str = "250";

/// Upper bound on followed pages so a misbehaving server cannot loop us forever.
const MAX_PAGES: usize = 100;

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Google Calendar provider
#[derive(Clone)]
pub struct GoogleCalendarClient {
    http_client: Client,
    api_base: Url,
}

impl GoogleCalendarClient {
    /// `api_base` is the v3 root, e.g. `https://www.googleapis.com/calendar/v3`.
    pub fn new(http_client: Client, api_base: Url) -> Self {
        Self {
            http_client,
            api_base,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CalendarError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| CalendarError::Network("calendar API base URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn events_url(&self, calendar_id: &str, rest: &[&str]) -> Result<Url, CalendarError> {
        let mut segments = vec!["calendars", calendar_id, "events"];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, CalendarError> {
        let response = request.send().await?;
        check_status(response).await
    }
}

/// Maps non-success responses onto [`CalendarError`].
async fn check_status(response: Response) -> Result<Response, CalendarError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());

    match status {
        StatusCode::UNAUTHORIZED => Err(CalendarError::Unauthorized),
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(CalendarError::NotFound),
        StatusCode::TOO_MANY_REQUESTS => Err(CalendarError::RateLimited { retry_after }),
        _ => {
            let body = response.text().await.unwrap_or_default();
            // Google reports per-user quota exhaustion as 403.
            if status == StatusCode::FORBIDDEN {
                let lower = body.to_lowercase();
                if lower.contains("ratelimitexceeded") || lower.contains("quotaexceeded") {
                    return Err(CalendarError::RateLimited { retry_after });
                }
            }
            debug!(status = status.as_u16(), body = %truncate(&body), "Calendar API error response");
            Err(CalendarError::Http {
                status: status.as_u16(),
                body: truncate(&body),
            })
        }
    }
}

#[async_trait]
impl CalendarClient for GoogleCalendarClient {
    async fn list_events(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<RemoteEvent>, CalendarError> {
        let url = self.events_url(calendar_id, &[])?;
        let time_min = time_min.to_rfc3339_opts(SecondsFormat::Secs, true);
        let time_max = time_max.to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut query: Vec<(&str, &str)> = vec![
                ("timeMin", time_min.as_str()),
                ("timeMax", time_max.as_str()),
                ("singleEvents", "true"),
                ("showDeleted", "true"),
                ("maxResults", PAGE_SIZE),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let response = self
                .send(
                    self.http_client
                        .get(url.clone())
                        .bearer_auth(session.access_token())
                        .query(&query),
                )
                .await?;
            let page: GoogleEventsResponse = response.json().await?;

            events.extend(page.items.into_iter().map(RemoteEvent::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(events),
            }
        }

        warn!(
            pages = MAX_PAGES,
            fetched = events.len(),
            "Stopped following event pages at the page limit"
        );
        Ok(events)
    }

    async fn create_event(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        draft: &EventDraft,
    ) -> Result<RemoteEvent, CalendarError> {
        let url = self.events_url(calendar_id, &[])?;
        let body = GoogleEventWrite::from(EventPatch::from(draft.clone()));

        let response = self
            .send(
                self.http_client
                    .post(url)
                    .bearer_auth(session.access_token())
                    .json(&body),
            )
            .await?;
        let event: GoogleEvent = response.json().await?;
        Ok(event.into())
    }

    async fn update_event(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<RemoteEvent, CalendarError> {
        let url = self.events_url(calendar_id, &[event_id])?;
        let body = GoogleEventWrite::from(patch.clone());

        let response = self
            .send(
                self.http_client
                    .patch(url)
                    .bearer_auth(session.access_token())
                    .json(&body),
            )
            .await?;
        let event: GoogleEvent = response.json().await?;
        Ok(event.into())
    }

    async fn delete_event(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), CalendarError> {
        let url = self.events_url(calendar_id, &[event_id])?;
        self.send(
            self.http_client
                .delete(url)
                .bearer_auth(session.access_token()),
        )
        .await?;
        Ok(())
    }

    async fn register_webhook(
        &self,
        session: &CalendarSession,
        calendar_id: &str,
        callback_url: &Url,
        verification_token: &str,
    ) -> Result<WebhookRegistration, CalendarError> {
        let url = self.events_url(calendar_id, &["watch"])?;
        let body = WatchRequest {
            id: Uuid::new_v4().to_string(),
            kind: "web_hook",
            address: callback_url.as_str(),
            token: verification_token,
        };

        let response = self
            .send(
                self.http_client
                    .post(url)
                    .bearer_auth(session.access_token())
                    .json(&body),
            )
            .await?;
        let channel: WatchResponse = response.json().await?;

        let resource_id = channel.resource_id.ok_or_else(|| {
            CalendarError::MalformedResponse("watch response is missing resourceId".into())
        })?;
        let expires_at = channel
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(WebhookRegistration {
            channel_id: channel.id,
            resource_id,
            expires_at,
        })
    }

    async fn deregister_webhook(
        &self,
        session: &CalendarSession,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), CalendarError> {
        let url = self.endpoint(&["channels", "stop"])?;
        let body = StopRequest {
            id: channel_id,
            resource_id,
        };
        self.send(
            self.http_client
                .post(url)
                .bearer_auth(session.access_token())
                .json(&body),
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventsResponse {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleEvent {
    id: String,
    status: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    start: Option<GoogleEventTime>,
    end: Option<GoogleEventTime>,
    updated: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<String>,
}

impl GoogleEventTime {
    fn parse(&self, event_id: &str) -> Option<EventTime> {
        if let Some(value) = self.date_time.as_deref() {
            return match DateTime::parse_from_rfc3339(value) {
                Ok(at) => Some(EventTime::DateTime(at.with_timezone(&Utc))),
                Err(_) => {
                    warn!(event_id, "Unparseable event dateTime");
                    None
                }
            };
        }
        let value = self.date.as_deref()?;
        match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            Ok(date) => Some(EventTime::Date(date)),
            Err(_) => {
                warn!(event_id, "Unparseable event date");
                None
            }
        }
    }
}

impl From<EventTime> for GoogleEventTime {
    fn from(time: EventTime) -> Self {
        match time {
            EventTime::DateTime(at) => GoogleEventTime {
                date_time: Some(at.to_rfc3339_opts(SecondsFormat::Secs, true)),
                date: None,
            },
            EventTime::Date(date) => GoogleEventTime {
                date_time: None,
                date: Some(date.format("%Y-%m-%d").to_string()),
            },
        }
    }
}

impl From<GoogleEvent> for RemoteEvent {
    fn from(event: GoogleEvent) -> Self {
        let start = event.start.as_ref().and_then(|t| t.parse(&event.id));
        let end = event.end.as_ref().and_then(|t| t.parse(&event.id));
        let updated = event
            .updated
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|at| at.with_timezone(&Utc));

        RemoteEvent {
            status: EventStatus::parse(event.status.as_deref()),
            summary: event.summary.filter(|s| !s.trim().is_empty()),
            description: event.description,
            start,
            end,
            updated,
            id: event.id,
        }
    }
}

#[derive(Debug, Serialize)]
struct GoogleEventWrite {
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    /// Serialized as `null` when cleared, which the API treats as removal.
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<GoogleEventTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<GoogleEventTime>,
}

impl From<EventPatch> for GoogleEventWrite {
    fn from(patch: EventPatch) -> Self {
        Self {
            summary: patch.summary,
            description: patch.description,
            start: patch.start.map(GoogleEventTime::from),
            end: patch.end.map(GoogleEventTime::from),
        }
    }
}

#[derive(Debug, Serialize)]
struct WatchRequest<'a> {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    address: &'a str,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    id: String,
    resource_id: Option<String>,
    /// Milliseconds since the epoch, encoded as a string
    expiration: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    id: &'a str,
    resource_id: &'a str,
}

fn truncate(body: &str) -> String {
    truncate_body(body, MAX_ERROR_BODY_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> GoogleCalendarClient {
        GoogleCalendarClient::new(Client::new(), Url::parse(base).expect("valid base"))
    }

    #[test]
    fn event_urls_percent_encode_calendar_ids() {
        let client = client("https://www.googleapis.com/calendar/v3");
        let url = client
            .events_url("team@example.com", &["evt 1"])
            .expect("url builds");
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/calendar/v3/calendars/team@example.com/events/evt%201"
        );
    }

    #[test]
    fn trailing_slash_on_base_is_tolerated() {
        let client = client("https://www.googleapis.com/calendar/v3/");
        let url = client.endpoint(&["channels", "stop"]).expect("url builds");
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/calendar/v3/channels/stop"
        );
    }

    #[test]
    fn timed_and_all_day_events_are_parsed() {
        let timed: GoogleEvent = serde_json::from_value(serde_json::json!({
            "id": "a",
            "status": "confirmed",
            "summary": "Standup",
            "start": {"dateTime": "2026-03-02T09:00:00+01:00"},
            "end": {"dateTime": "2026-03-02T09:15:00+01:00"},
            "updated": "2026-03-01T12:00:00.000Z"
        }))
        .expect("valid event");
        let timed = RemoteEvent::from(timed);
        assert_eq!(
            timed.start.map(EventTime::to_utc).map(|t| t.to_rfc3339()),
            Some("2026-03-02T08:00:00+00:00".to_string())
        );
        assert!(timed.updated.is_some());

        let all_day: GoogleEvent = serde_json::from_value(serde_json::json!({
            "id": "b",
            "start": {"date": "2026-03-05"},
            "end": {"date": "2026-03-06"}
        }))
        .expect("valid event");
        let all_day = RemoteEvent::from(all_day);
        assert!(all_day.start.is_some_and(EventTime::is_all_day));
        assert_eq!(all_day.status, EventStatus::Confirmed);
        assert!(all_day.updated.is_none());
    }

    #[test]
    fn cancelled_events_may_omit_times() {
        let cancelled: GoogleEvent = serde_json::from_value(serde_json::json!({
            "id": "c",
            "status": "cancelled"
        }))
        .expect("valid event");
        let cancelled = RemoteEvent::from(cancelled);
        assert!(cancelled.is_cancelled());
        assert!(cancelled.start.is_none());
        assert!(cancelled.end.is_none());
    }

    #[test]
    fn patch_body_omits_unset_fields() {
        let body = GoogleEventWrite::from(EventPatch {
            summary: Some("Renamed".into()),
            ..Default::default()
        });
        assert_eq!(
            serde_json::to_value(&body).expect("serializes"),
            serde_json::json!({"summary": "Renamed"})
        );
    }

    #[test]
    fn cleared_description_is_sent_as_null() {
        let body = GoogleEventWrite::from(EventPatch {
            description: Some(None),
            ..Default::default()
        });
        assert_eq!(
            serde_json::to_value(&body).expect("serializes"),
            serde_json::json!({"description": null})
        );
    }

    #[test]
    fn all_day_boundaries_serialize_as_dates() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 5).expect("valid date");
        let value = serde_json::to_value(GoogleEventTime::from(EventTime::Date(date)))
            .expect("serializes");
        assert_eq!(value, serde_json::json!({"date": "2026-03-05"}));
    }
}
