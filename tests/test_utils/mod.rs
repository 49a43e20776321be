//! Test utilities shared by the integration tests.
//!
//! In-memory SQLite with migrations applied, a fully wired [`AppState`] over
//! the in-memory calendar, and fixture builders for connections and events.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode},
};
use chrono::{DateTime, TimeDelta, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use calendar_sync::audit::{AuditEvent, AuditSink};
use calendar_sync::calendar::{
    EventStatus, EventTime, GOOGLE_PROVIDER, InMemoryCalendar, PRIMARY_CALENDAR, RemoteEvent,
};
use calendar_sync::config::AppConfig;
use calendar_sync::crypto::{self, CryptoKey};
use calendar_sync::models::calendar_connection;
use calendar_sync::repositories::{EntryContent, NewConnection};
use calendar_sync::server::{AppState, create_app};

pub const OPERATOR_TOKEN: &str = "test-operator-token";
pub const CRYPTO_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
pub const STATE_SECRET: &str = "integration-test-state-secret-0123456789";
pub const SESSION_COOKIE: &str = "session_id";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn crypto_key() -> CryptoKey {
    CryptoKey::from_hex(CRYPTO_KEY_HEX).expect("valid test key")
}

/// Configuration with webhooks enabled and OAuth endpoints under `oauth_base`
/// (a wiremock server in lifecycle tests).
pub fn test_config(oauth_base: &str) -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        crypto_key: Some(CRYPTO_KEY_HEX.to_string()),
        state_secret: Some(STATE_SECRET.to_string()),
        google_client_id: Some("client-id".to_string()),
        google_client_secret: Some("client-secret".to_string()),
        google_redirect_uri: Some("https://calendar.example.com/api/calendar/callback".to_string()),
        google_token_url: format!("{}/token", oauth_base),
        google_revoke_url: format!("{}/revoke", oauth_base),
        public_base_url: Some("https://calendar.example.com".to_string()),
        app_redirect_url: "https://app.example.com/settings/calendar".to_string(),
        ..Default::default()
    }
}

/// Audit sink that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A wired application over an in-memory database and calendar.
pub struct TestApp {
    pub state: AppState,
    pub calendar: Arc<InMemoryCalendar>,
    pub audit: Arc<RecordingAuditSink>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config("http://127.0.0.1:9")).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let db = setup_test_db().await.expect("test database");
        let calendar = Arc::new(InMemoryCalendar::new());
        let audit = Arc::new(RecordingAuditSink::default());
        let state = AppState::build(config, db, calendar.clone(), audit.clone())
            .expect("application state");
        Self {
            state,
            calendar,
            audit,
        }
    }

    /// Stores a connection whose access token stays fresh for an hour.
    pub async fn connect(&self, tenant_id: Uuid, principal_id: Uuid) -> calendar_connection::Model {
        self.connect_with_expiry(tenant_id, principal_id, Utc::now() + TimeDelta::hours(1))
            .await
    }

    pub async fn connect_with_expiry(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        token_expires_at: DateTime<Utc>,
    ) -> calendar_connection::Model {
        let key = crypto_key();
        self.state
            .connections
            .upsert_authorized(NewConnection {
                tenant_id,
                principal_id,
                provider: GOOGLE_PROVIDER.to_string(),
                calendar_id: PRIMARY_CALENDAR.to_string(),
                access_token_ciphertext: crypto::encrypt("access-token", &key).unwrap(),
                refresh_token_ciphertext: crypto::encrypt("refresh-token", &key).unwrap(),
                token_expires_at,
                sync_range_start_days: -7,
                sync_range_end_days: 28,
            })
            .await
            .expect("store connection")
    }

    /// Registers a webhook channel through the channel manager and returns the
    /// refreshed connection.
    pub async fn with_channel(
        &self,
        mut connection: calendar_connection::Model,
    ) -> calendar_connection::Model {
        self.state
            .channels
            .register(&mut connection)
            .await
            .expect("register channel")
            .expect("webhooks enabled");
        self.reload(&connection).await
    }

    /// The full router over this state.
    pub fn router(&self) -> Router {
        create_app(self.state.clone())
    }

    pub async fn reload(&self, connection: &calendar_connection::Model) -> calendar_connection::Model {
        self.state
            .connections
            .find_by_id(connection.tenant_id, connection.id)
            .await
            .unwrap()
            .expect("connection exists")
    }
}

/// A timed remote event starting `offset_hours` from now, lasting one hour.
pub fn remote_event(id: &str, summary: &str, offset_hours: i64, updated: DateTime<Utc>) -> RemoteEvent {
    let start = Utc::now() + TimeDelta::hours(offset_hours);
    RemoteEvent {
        id: id.to_string(),
        status: EventStatus::Confirmed,
        summary: Some(summary.to_string()),
        description: None,
        start: Some(EventTime::DateTime(start)),
        end: Some(EventTime::DateTime(start + TimeDelta::hours(1))),
        updated: Some(updated),
    }
}

/// Content for an internal entry starting `offset_hours` from now.
pub fn entry_content(title: &str, offset_hours: i64) -> EntryContent {
    let start = Utc::now() + TimeDelta::hours(offset_hours);
    EntryContent {
        title: title.to_string(),
        description: Some(format!("{} notes", title)),
        start_at: start,
        end_at: start + TimeDelta::minutes(30),
        all_day: false,
    }
}

/// Sends one request through `app` and returns status, headers and the JSON
/// body (`Value::Null` when the body is empty or not JSON).
pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.oneshot(request).await.expect("router is infallible");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

/// A request carrying the operator bearer token and the context headers.
pub fn authorized(method: &str, uri: &str, tenant_id: Uuid, principal_id: Uuid) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", OPERATOR_TOKEN))
        .header("X-Tenant-Id", tenant_id.to_string())
        .header("X-Principal-Id", principal_id.to_string())
}
