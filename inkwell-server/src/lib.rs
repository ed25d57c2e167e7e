//! Collaboration engine: document state machine, durability, presence,
//! auth, and the axum routes that tie them together, generalized from a
//! single-route text editor backend to a slug-addressed document API.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use inkwell_protocol::{AuthOutcome, Slug, SnapshotFrame};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod auth;
pub mod buffer;
pub mod config;
pub mod document;
pub mod durability;
pub mod error;
pub mod hub;
pub mod presence;

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: ServerConfig,
}

/// Assemble the full router: `/api/snapshot`, `/api/password`, `/api/ws`,
/// `/api/stats`, wrapped in trace/timeout/concurrency-limit layering.
/// Returns the shared [`Hub`] alongside the router so callers can run the
/// idle-eviction sweep independently of serving requests.
pub fn app(config: ServerConfig) -> (Router, Arc<Hub>) {
    let hub = Arc::new(Hub::new(&config));
    let state = AppState { hub: Arc::clone(&hub), config };

    let router = Router::new()
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/password", post(password_handler))
        .route("/api/ws", get(ws_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(tower::limit::ConcurrencyLimitLayer::new(512))
                .layer(tower::timeout::TimeoutLayer::new(Duration::from_secs(30))),
        );

    (router, hub)
}

#[derive(Deserialize)]
struct SlugParam {
    slug: String,
    /// Base64 `slug:password` credentials, decoded the same way as an
    /// `Authorization: Basic` header. Carried as a query parameter because
    /// a browser's WebSocket API cannot set custom request headers on the
    /// upgrade request, so this is the only way a password-protected
    /// document is reachable from a browser client. Takes priority over
    /// the header when both are present.
    token: Option<String>,
}

fn extract_password(headers: &HeaderMap, token: Option<&str>) -> Option<String> {
    if let Some(token) = token {
        if let Some((_, password)) = auth::parse_basic_auth(&format!("Basic {token}")) {
            return Some(password);
        }
    }
    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (_, password) = auth::parse_basic_auth(header)?;
    Some(password)
}

fn parse_slug(raw: &str) -> Result<Slug, AppError> {
    raw.parse::<Slug>().map_err(|e| AppError::bad_request(e.to_string()))
}

async fn snapshot_handler(
    State(state): State<AppState>,
    Query(params): Query<SlugParam>,
    headers: HeaderMap,
) -> Result<Json<SnapshotFrame>, AppError> {
    let slug = parse_slug(&params.slug)?;
    let password = extract_password(&headers, params.token.as_deref());
    let handle = state.hub.get_or_spawn(&slug).await?;
    match handle.peek(password).await? {
        Ok(peek) => Ok(Json(SnapshotFrame { rev: peek.rev, text: peek.text, presence: peek.presence, auth: AuthOutcome::Ok })),
        Err(_) => Err(AppError::unauthorized()),
    }
}

#[derive(Deserialize)]
struct SetPasswordBody {
    current: Option<String>,
    new: Option<String>,
}

#[derive(Serialize)]
struct SetPasswordResponse {
    ok: bool,
}

async fn password_handler(
    State(state): State<AppState>,
    Query(params): Query<SlugParam>,
    Json(body): Json<SetPasswordBody>,
) -> Result<Json<SetPasswordResponse>, AppError> {
    let slug = parse_slug(&params.slug)?;
    let handle = state.hub.get_or_spawn(&slug).await?;
    match handle.set_password(body.current, body.new).await? {
        Ok(()) => Ok(Json(SetPasswordResponse { ok: true })),
        Err(_) => Err(AppError::unauthorized()),
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<SlugParam>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let slug = parse_slug(&params.slug)?;
    let password = extract_password(&headers, params.token.as_deref());
    let hub = Arc::clone(&state.hub);
    let heartbeat = state.config.heartbeat_interval;
    info!(%slug, "websocket upgrade requested");
    Ok(ws.on_upgrade(move |socket| hub::handle_socket(socket, hub, slug, password, heartbeat)))
}

#[derive(Serialize)]
struct Stats {
    open_documents: usize,
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(Stats { open_documents: state.hub.open_document_count() }))
}
