//! Push-notification ingress over the HTTP router.

use anyhow::Result;
use axum::{body::Body, http::Request, http::StatusCode};
use chrono::{TimeDelta, Utc};
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

use calendar_sync::models::calendar_connection::{self, ConnectionStatus};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{TestApp, remote_event, send};

fn notification(channel_id: Option<&str>, token: Option<&str>, state: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/calendar/webhook")
        .header("X-Goog-Resource-State", state)
        .header("X-Goog-Resource-ID", "resource-1");
    if let Some(channel_id) = channel_id {
        builder = builder.header("X-Goog-Channel-ID", channel_id);
    }
    if let Some(token) = token {
        builder = builder.header("X-Goog-Channel-Token", token);
    }
    builder.body(Body::empty()).unwrap()
}

async fn connected_with_channel(app: &TestApp) -> calendar_connection::Model {
    let connection = app.connect(Uuid::new_v4(), Uuid::new_v4()).await;
    app.with_channel(connection).await
}

#[tokio::test]
async fn sync_handshake_is_acknowledged_without_lookup() -> Result<()> {
    let app = TestApp::new().await;

    let (status, _, body) = send(app.router(), notification(Some("unknown"), None, "sync")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    Ok(())
}

#[tokio::test]
async fn missing_channel_id_is_a_bad_request() -> Result<()> {
    let app = TestApp::new().await;

    let (status, _, body) = send(app.router(), notification(None, Some("t"), "exists")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    Ok(())
}

#[tokio::test]
async fn unknown_channel_is_not_found() -> Result<()> {
    let app = TestApp::new().await;

    let (status, _, body) =
        send(app.router(), notification(Some("no-such-channel"), Some("t"), "exists")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not found");
    Ok(())
}

#[tokio::test]
async fn wrong_or_missing_token_is_forbidden() -> Result<()> {
    let app = TestApp::new().await;
    let connection = connected_with_channel(&app).await;
    let channel_id = connection.webhook_channel_id.as_deref();

    let (status, _, body) = send(app.router(), notification(channel_id, Some("forged"), "exists")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let (status, _, _) = send(app.router(), notification(channel_id, None, "exists")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(app.calendar.calls().list, 0);
    Ok(())
}

#[tokio::test]
async fn token_from_another_tenant_is_rejected() -> Result<()> {
    let app = TestApp::new().await;
    let first = connected_with_channel(&app).await;
    let second = connected_with_channel(&app).await;
    assert_ne!(first.tenant_id, second.tenant_id);

    let (status, _, _) = send(
        app.router(),
        notification(
            first.webhook_channel_id.as_deref(),
            second.webhook_token.as_deref(),
            "exists",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn change_notification_runs_an_import() -> Result<()> {
    let app = TestApp::new().await;
    let connection = connected_with_channel(&app).await;
    app.calendar
        .put_event(remote_event("evt-1", "Pushed", 3, Utc::now() - TimeDelta::minutes(1)));

    let (status, _, body) = send(
        app.router(),
        notification(
            connection.webhook_channel_id.as_deref(),
            connection.webhook_token.as_deref(),
            "exists",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["imported"], 1);
    assert!(
        app.state
            .entries
            .find_by_external_id(connection.tenant_id, "google", "evt-1")
            .await?
            .is_some()
    );
    Ok(())
}

#[tokio::test]
async fn import_failure_is_reported_with_ok_status() -> Result<()> {
    let app = TestApp::new().await;
    let connection = connected_with_channel(&app).await;
    app.calendar.fail_list(true);

    let (status, _, body) = send(
        app.router(),
        notification(
            connection.webhook_channel_id.as_deref(),
            connection.webhook_token.as_deref(),
            "update",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("failed to list remote events"));
    assert_eq!(app.reload(&connection).await.status, ConnectionStatus::Error);
    Ok(())
}

#[tokio::test]
async fn not_exists_retires_the_channel() -> Result<()> {
    let app = TestApp::new().await;
    let connection = connected_with_channel(&app).await;

    let (status, _, body) = send(
        app.router(),
        notification(
            connection.webhook_channel_id.as_deref(),
            connection.webhook_token.as_deref(),
            "not_exists",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let refreshed = app.reload(&connection).await;
    assert!(!refreshed.has_webhook_channel());
    assert!(refreshed.webhook_token.is_none());
    assert_eq!(refreshed.status, ConnectionStatus::Error);

    // The retired channel no longer authenticates.
    let (status, _, _) = send(
        app.router(),
        notification(
            connection.webhook_channel_id.as_deref(),
            connection.webhook_token.as_deref(),
            "exists",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn disconnected_connection_is_acknowledged_without_sync() -> Result<()> {
    let app = TestApp::new().await;
    let connection = connected_with_channel(&app).await;
    calendar_connection::ActiveModel {
        id: Set(connection.id),
        status: Set(ConnectionStatus::Disconnected),
        ..Default::default()
    }
    .update(app.state.db.as_ref())
    .await?;

    let (status, _, body) = send(
        app.router(),
        notification(
            connection.webhook_channel_id.as_deref(),
            connection.webhook_token.as_deref(),
            "exists",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "connection disconnected");
    assert_eq!(app.calendar.calls().list, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_resource_state_is_acknowledged() -> Result<()> {
    let app = TestApp::new().await;
    let connection = connected_with_channel(&app).await;

    let (status, _, body) = send(
        app.router(),
        notification(
            connection.webhook_channel_id.as_deref(),
            connection.webhook_token.as_deref(),
            "mystery",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "ignored");
    assert_eq!(app.calendar.calls().list, 0);
    Ok(())
}
