//! Connect, callback, status, manual sync and disconnect through the router,
//! with the provider's token and revocation endpoints served by wiremock.

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use chrono::{TimeDelta, Utc};
use serde_json::{Value, json};
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use calendar_sync::audit::AuditAction;
use calendar_sync::crypto;
use calendar_sync::oauth::{StateClaims, StateSigner};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{
    OPERATOR_TOKEN, STATE_SECRET, TestApp, authorized, crypto_key, entry_content, send,
    test_config,
};

const SESSION: &str = "browser-session-1";

async fn app_with_provider() -> (TestApp, MockServer) {
    let server = MockServer::start().await;
    let app = TestApp::with_config(test_config(&server.uri())).await;
    (app, server)
}

async fn mount_token_exchange(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-access",
            "refresh_token": "fresh-refresh",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .mount(server)
        .await;
}

/// Calls the connect endpoint and returns the state token from the consent URL.
async fn start_connect(app: &TestApp, tenant: Uuid, principal: Uuid) -> String {
    let request = authorized("POST", "/api/calendar/connect", tenant, principal)
        .header(header::COOKIE, format!("session_id={}", SESSION))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::OK, "connect failed: {}", body);

    let url = Url::parse(body["authorization_url"].as_str().unwrap()).unwrap();
    url.query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .expect("state parameter")
}

async fn callback(app: &TestApp, query: &str, session: Option<&str>) -> String {
    let mut builder = Request::builder()
        .method("GET")
        .uri(format!("/api/calendar/callback?{}", query));
    if let Some(session) = session {
        builder = builder.header(header::COOKIE, format!("session_id={}", session));
    }
    let (status, headers, _) = send(app.router(), builder.body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    headers[header::LOCATION].to_str().unwrap().to_string()
}

fn query(code: &str, state: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("code", code)
        .append_pair("state", state)
        .finish()
}

#[tokio::test]
async fn connect_returns_consent_url_bound_to_session() -> Result<()> {
    let (app, _server) = app_with_provider().await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());

    let state_token = start_connect(&app, tenant, principal).await;

    let claims = StateSigner::new(STATE_SECRET.as_bytes())?.validate(&state_token, Some(SESSION), Utc::now())?;
    assert_eq!(claims.tenant_id, tenant);
    assert_eq!(claims.principal_id, principal);
    Ok(())
}

#[tokio::test]
async fn connect_requires_bearer_token_and_session_cookie() -> Result<()> {
    let (app, _server) = app_with_provider().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/calendar/connect")
        .header("X-Tenant-Id", Uuid::new_v4().to_string())
        .header("X-Principal-Id", Uuid::new_v4().to_string())
        .body(Body::empty())?;
    let (status, _, _) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = authorized("POST", "/api/calendar/connect", Uuid::new_v4(), Uuid::new_v4())
        .body(Body::empty())?;
    let (status, _, body) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["cookie"].is_string());
    Ok(())
}

#[tokio::test]
async fn full_connect_flow_stores_connection_and_registers_channel() -> Result<()> {
    let (app, server) = app_with_provider().await;
    mount_token_exchange(&server).await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());

    let state_token = start_connect(&app, tenant, principal).await;
    let location = callback(&app, &query("auth-code-1", &state_token), Some(SESSION)).await;

    assert_eq!(location, "https://app.example.com/settings/calendar?success=connected");
    let connection = app
        .state
        .connections
        .find_for_principal(tenant, principal, "google")
        .await?
        .expect("connection stored");
    assert_eq!(
        crypto::decrypt(&connection.access_token_ciphertext, &crypto_key())?,
        "fresh-access"
    );
    assert_eq!(
        crypto::decrypt(&connection.refresh_token_ciphertext, &crypto_key())?,
        "fresh-refresh"
    );
    assert!(connection.has_webhook_channel());
    assert_eq!(app.calendar.channels().len(), 1);
    assert_eq!(
        app.calendar.channels()[0].address,
        "https://calendar.example.com/api/calendar/webhook"
    );
    assert!(
        app.audit
            .events()
            .iter()
            .any(|event| event.action == AuditAction::ConnectionEstablished && event.tenant_id == tenant)
    );

    let request = authorized("GET", "/api/calendar/connection", tenant, principal).body(Body::empty())?;
    let (status, _, body) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["webhook_active"], true);
    assert!(body.get("access_token_ciphertext").is_none());

    // A second connect while active conflicts.
    let request = authorized("POST", "/api/calendar/connect", tenant, principal)
        .header(header::COOKIE, format!("session_id={}", SESSION))
        .body(Body::empty())?;
    let (status, _, _) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn reauthorizing_errored_connection_replaces_its_channel() -> Result<()> {
    let (app, server) = app_with_provider().await;
    mount_token_exchange(&server).await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());
    let connection = app.with_channel(app.connect(tenant, principal).await).await;
    let old_channel = connection.webhook_channel_id.clone().expect("channel");
    app.state
        .connections
        .record_sync_failure(tenant, connection.id, "refresh token revoked")
        .await?;

    let state_token = start_connect(&app, tenant, principal).await;
    let location = callback(&app, &query("auth-code-1", &state_token), Some(SESSION)).await;

    assert_eq!(location, "https://app.example.com/settings/calendar?success=connected");
    let channels = app.calendar.channels();
    assert_eq!(channels.len(), 1);
    assert_ne!(channels[0].channel_id, old_channel);
    assert_eq!(app.calendar.calls().deregister, 1);
    let stored = app.reload(&connection).await;
    assert_eq!(stored.webhook_channel_id.as_deref(), Some(channels[0].channel_id.as_str()));
    Ok(())
}

#[tokio::test]
async fn callback_rejects_state_from_another_session() -> Result<()> {
    let (app, server) = app_with_provider().await;
    mount_token_exchange(&server).await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());
    let state_token = start_connect(&app, tenant, principal).await;

    let other = callback(&app, &query("auth-code-1", &state_token), Some("someone-else")).await;
    let missing = callback(&app, &query("auth-code-1", &state_token), None).await;

    assert!(other.ends_with("error=session_mismatch"));
    assert!(missing.ends_with("error=session_mismatch"));
    assert!(
        app.state
            .connections
            .find_for_principal(tenant, principal, "google")
            .await?
            .is_none()
    );
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    Ok(())
}

#[tokio::test]
async fn callback_rejects_expired_and_tampered_state() -> Result<()> {
    let (app, _server) = app_with_provider().await;
    let signer = StateSigner::new(STATE_SECRET.as_bytes())?;
    let mut claims = StateClaims::new(SESSION, Uuid::new_v4(), Uuid::new_v4());
    claims.issued_at = (Utc::now() - TimeDelta::minutes(11)).timestamp();
    let expired = signer.issue(&claims)?;

    let location = callback(&app, &query("auth-code-1", &expired), Some(SESSION)).await;
    assert!(location.ends_with("error=expired"));

    let forged = StateSigner::new(b"some-other-secret-that-is-long-enough")?
        .issue(&StateClaims::new(SESSION, Uuid::new_v4(), Uuid::new_v4()))?;
    let location = callback(&app, &query("auth-code-1", &forged), Some(SESSION)).await;
    assert!(location.ends_with("error=invalid_state"));

    let location = callback(&app, &query("auth-code-1", "garbage"), Some(SESSION)).await;
    assert!(location.ends_with("error=invalid_state"));
    Ok(())
}

#[tokio::test]
async fn callback_reports_provider_and_request_errors() -> Result<()> {
    let (app, _server) = app_with_provider().await;

    let denied = callback(&app, "error=access_denied", Some(SESSION)).await;
    assert!(denied.ends_with("error=auth_failed"));

    let missing_code = callback(&app, "state=abc", Some(SESSION)).await;
    assert!(missing_code.ends_with("error=invalid_request"));

    let missing_everything = callback(&app, "", Some(SESSION)).await;
    assert!(missing_everything.ends_with("error=invalid_request"));
    Ok(())
}

#[tokio::test]
async fn failed_code_exchange_stores_nothing() -> Result<()> {
    let (app, server) = app_with_provider().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })))
        .mount(&server)
        .await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());
    let state_token = start_connect(&app, tenant, principal).await;

    let location = callback(&app, &query("auth-code-1", &state_token), Some(SESSION)).await;

    assert!(location.ends_with("error=token_failed"));
    assert!(
        app.state
            .connections
            .find_for_principal(tenant, principal, "google")
            .await?
            .is_none()
    );
    assert!(app.audit.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn disconnect_survives_revocation_failure() -> Result<()> {
    let (app, server) = app_with_provider().await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .and(body_string_contains("token=access-token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());
    let connection = app.connect(tenant, principal).await;
    app.with_channel(connection).await;
    let entry = app
        .state
        .entries
        .create_internal(tenant, principal, entry_content("Keeps living", 2))
        .await?;

    let request = authorized("DELETE", "/api/calendar/connection", tenant, principal).body(Body::empty())?;
    let (status, _, body) = send(app.router(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));
    assert!(
        app.state
            .connections
            .find_for_principal(tenant, principal, "google")
            .await?
            .is_none()
    );
    assert!(app.calendar.channels().is_empty());
    // Entries are not removed with the connection.
    assert!(app.state.entries.find_by_id(tenant, entry.id).await?.is_some());
    assert!(
        app.audit
            .events()
            .iter()
            .any(|event| event.action == AuditAction::ConnectionRemoved)
    );

    let request = authorized("DELETE", "/api/calendar/connection", tenant, principal).body(Body::empty())?;
    let (status, _, _) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn manual_sync_validates_and_reports_counts() -> Result<()> {
    let (app, _server) = app_with_provider().await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());

    let request = authorized("POST", "/api/calendar/sync", tenant, principal)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"direction":"both"}"#))?;
    let (status, _, _) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.connect(tenant, principal).await;
    app.state
        .entries
        .create_internal(tenant, principal, entry_content("Export me", 5))
        .await?;

    let request = authorized("POST", "/api/calendar/sync", tenant, principal)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"direction":"sideways"}"#))?;
    let (status, _, _) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = authorized("POST", "/api/calendar/sync", tenant, principal)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"direction":"both"}"#))?;
    let (status, _, body) = send(app.router(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": true, "imported": 0, "exported": 1, "errors": [] })
    );
    let audit = app.audit.events();
    let manual = audit
        .iter()
        .find(|event| event.action == AuditAction::ManualSync)
        .expect("manual sync audited");
    assert_eq!(manual.metadata["exported"], Value::from(1));
    Ok(())
}

#[tokio::test]
async fn manual_sync_renews_missing_webhook_channel() -> Result<()> {
    let (app, _server) = app_with_provider().await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());
    let connection = app.connect(tenant, principal).await;
    assert!(!connection.has_webhook_channel());

    let request = authorized("POST", "/api/calendar/sync", tenant, principal)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"direction":"import"}"#))?;
    let (status, _, _) = send(app.router(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(app.reload(&connection).await.has_webhook_channel());
    Ok(())
}

#[tokio::test]
async fn status_is_not_found_without_connection() -> Result<()> {
    let (app, _server) = app_with_provider().await;

    let request = Request::builder()
        .method("GET")
        .uri("/api/calendar/connection")
        .header(header::AUTHORIZATION, format!("Bearer {}", OPERATOR_TOKEN))
        .header("X-Tenant-Id", Uuid::new_v4().to_string())
        .header("X-Principal-Id", Uuid::new_v4().to_string())
        .body(Body::empty())?;
    let (status, _, body) = send(app.router(), request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn health_reports_database_status() -> Result<()> {
    let (app, _server) = app_with_provider().await;

    let request = Request::builder().uri("/healthz").body(Body::empty())?;
    let (status, headers, body) = send(app.router(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-request-id"));
    assert!(body.is_object());
    Ok(())
}

#[tokio::test]
async fn manual_import_with_empty_calendar_reports_zero_counts() -> Result<()> {
    let (app, _server) = app_with_provider().await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());
    app.connect(tenant, principal).await;

    let request = authorized("POST", "/api/calendar/sync", tenant, principal)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"direction":"import"}"#))?;
    let (status, _, body) = send(app.router(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": true, "imported": 0, "exported": 0, "errors": [] })
    );
    Ok(())
}

#[tokio::test]
async fn manual_sync_both_imports_and_exports_in_one_call() -> Result<()> {
    let (app, _server) = app_with_provider().await;
    let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());
    app.connect(tenant, principal).await;
    app.calendar.put_event(test_utils::remote_event(
        "evt-remote",
        "From remote",
        4,
        Utc::now() - TimeDelta::minutes(10),
    ));
    let local = app
        .state
        .entries
        .create_internal(tenant, principal, entry_content("From here", 8))
        .await?;

    let request = authorized("POST", "/api/calendar/sync", tenant, principal)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"direction":"both"}"#))?;
    let (status, _, body) = send(app.router(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": true, "imported": 1, "exported": 1, "errors": [] })
    );

    let imported = app
        .state
        .entries
        .find_by_external_id(tenant, "google", "evt-remote")
        .await?
        .expect("imported entry");
    let remote = app.calendar.event("evt-remote").expect("remote event");
    assert_eq!(imported.external_updated_at, remote.updated);

    let exported = app.state.entries.find_by_id(tenant, local.id).await?.expect("entry");
    let external_id = exported.external_id.expect("exported entry has an external id");
    let created = app.calendar.event(&external_id).expect("created remote event");
    assert!(exported.external_updated_at >= created.updated);
    Ok(())
}
