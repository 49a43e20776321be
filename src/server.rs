//! # Server Configuration
//!
//! Application state wiring, the router and the OpenAPI document.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use reqwest::Client;
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use url::Url;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::auth::auth_middleware;
use crate::calendar::{CalendarClient, GoogleCalendarClient};
use crate::config::{AppConfig, ConfigError};
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::oauth::{GoogleOAuthClient, OAuthSettings, StateSigner, TokenManager};
use crate::repositories::{ConnectionRepository, EntryRepository};
use crate::sync::SyncEngine;
use crate::telemetry;
use crate::webhook::{ChannelManager, WebhookIngress};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub crypto_key: CryptoKey,
    pub state_signer: Arc<StateSigner>,
    pub oauth: Arc<GoogleOAuthClient>,
    pub connections: ConnectionRepository,
    pub entries: EntryRepository,
    pub tokens: TokenManager,
    pub sync_engine: Arc<SyncEngine>,
    pub channels: ChannelManager,
    pub webhooks: WebhookIngress,
    pub audit: Arc<dyn AuditSink>,
}

impl AppState {
    /// Wires every component from configuration. The calendar client and the
    /// audit sink are injected so tests can substitute in-memory versions.
    pub fn build(
        config: AppConfig,
        db: DatabaseConnection,
        calendar: Arc<dyn CalendarClient>,
        audit: Arc<dyn AuditSink>,
    ) -> anyhow::Result<Self> {
        let crypto_key = config.vault_key()?;
        let state_secret = config
            .state_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .ok_or(ConfigError::MissingStateSecret)?;
        let state_signer = Arc::new(
            StateSigner::new(state_secret.as_bytes()).context("building state token signer")?,
        );

        let oauth = Arc::new(GoogleOAuthClient::new(
            OAuthSettings::from_config(&config),
            http_client(&config).context("building OAuth HTTP client")?,
        ));

        let db = Arc::new(db);
        let connections = ConnectionRepository::new(Arc::clone(&db));
        let entries = EntryRepository::new(Arc::clone(&db));
        let tokens = TokenManager::new(
            Arc::clone(&oauth),
            connections.clone(),
            crypto_key.clone(),
            config.token_refresh_skew_seconds,
        );
        let sync_engine = Arc::new(SyncEngine::new(
            Arc::clone(&calendar),
            connections.clone(),
            entries.clone(),
            tokens.clone(),
            config.propagate_deletions,
        ));
        let channels = ChannelManager::new(
            calendar,
            connections.clone(),
            tokens.clone(),
            config.webhook_callback_url(),
        );
        let webhooks = WebhookIngress::new(connections.clone(), Arc::clone(&sync_engine));

        Ok(Self {
            config: Arc::new(config),
            db,
            crypto_key,
            state_signer,
            oauth,
            connections,
            entries,
            tokens,
            sync_engine,
            channels,
            webhooks,
            audit,
        })
    }
}

/// HTTP client shared by the remote adapters; every request is bounded by
/// the configured timeout.
pub fn http_client(config: &AppConfig) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_seconds))
        .connect_timeout(Duration::from_secs(config.http_timeout_seconds.min(10)))
        .build()
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/calendar/connect", post(handlers::calendar::connect))
        .route(
            "/api/calendar/connection",
            get(handlers::calendar::connection_status).delete(handlers::calendar::disconnect),
        )
        .route("/api/calendar/sync", post(handlers::calendar::manual_sync))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/api/calendar/callback", get(handlers::calendar::callback))
        .route("/api/calendar/webhook", post(handlers::webhook::receive))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(telemetry::trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Starts the server with the given configuration and runs until `shutdown`
/// is cancelled.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = config
        .bind_addr()
        .with_context(|| format!("invalid server address '{}'", config.api_bind_addr))?;

    let api_base = Url::parse(&config.google_calendar_api_base)
        .with_context(|| format!("invalid calendar API base '{}'", config.google_calendar_api_base))?;
    let calendar: Arc<dyn CalendarClient> = Arc::new(GoogleCalendarClient::new(
        http_client(&config).context("building calendar HTTP client")?,
        api_base,
    ));

    let profile = config.profile.clone();
    let webhooks_enabled = config.webhook_callback_url().is_some();
    let state = AppState::build(config, db, calendar, Arc::new(TracingAuditSink))?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(%addr, %profile, webhooks_enabled, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server terminated")?;

    tracing::info!("Server stopped");
    Ok(())
}

struct BearerAuthAddon;

impl Modify for BearerAuthAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::health,
        crate::handlers::calendar::connect,
        crate::handlers::calendar::callback,
        crate::handlers::calendar::connection_status,
        crate::handlers::calendar::manual_sync,
        crate::handlers::calendar::disconnect,
        crate::handlers::webhook::receive,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::sync::SyncDirection,
            crate::handlers::calendar::ConnectResponse,
            crate::handlers::calendar::ConnectionStatusResponse,
            crate::handlers::calendar::SyncRequest,
            crate::handlers::calendar::SyncResponse,
            crate::handlers::calendar::DisconnectResponse,
            crate::webhook::WebhookResponse,
        )
    ),
    modifiers(&BearerAuthAddon),
    tags(
        (name = "calendar", description = "Calendar connection lifecycle and manual sync"),
        (name = "webhooks", description = "Push notifications from the calendar provider"),
        (name = "health", description = "Service health"),
    ),
    info(
        title = "Calendar Sync API",
        description = "Keeps internal calendar entries in sync with an external calendar account",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
