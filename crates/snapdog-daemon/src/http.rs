//! HTTP/JSON surface of the command/status bus, plus the SSE push channel
//! and health endpoints.
//!
//! Every mutating endpoint parses into a typed command with `Source = Http`
//! and dispatches it; responses carry the fresh zone/client snapshot.  Errors
//! map onto HTTP statuses through the shared taxonomy.  Auth is a coarse
//! `X-API-Key` allow-list; the rate limiter is a token bucket per key (or
//! per peer when auth is off).  Health endpoints bypass both.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use snapdog_core::command::{
    ClientMac, Command, CommandEnvelope, CommandSource, StatusEvent,
};
use snapdog_core::config::ApiConfig;
use snapdog_core::state::ClientState;
use snapdog_core::{Error, Result};

use crate::catalog::MediaCatalog;
use crate::dispatcher::Dispatcher;
use crate::notify::StatusSink;
use crate::zone::ZoneManager;

// ── push sink ─────────────────────────────────────────────────────────────────

/// Status sink that feeds the SSE channel.
pub struct HttpPushSink {
    events_tx: broadcast::Sender<StatusEvent>,
}

impl HttpPushSink {
    pub fn new() -> (Arc<Self>, broadcast::Sender<StatusEvent>) {
        let (events_tx, _) = broadcast::channel(256);
        (
            Arc::new(Self {
                events_tx: events_tx.clone(),
            }),
            events_tx,
        )
    }
}

#[async_trait::async_trait]
impl StatusSink for HttpPushSink {
    fn name(&self) -> &'static str {
        "http-push"
    }

    async fn deliver(&self, event: &StatusEvent) -> Result<()> {
        // no subscribers is fine; SSE clients come and go
        let _ = self.events_tx.send(event.clone());
        Ok(())
    }
}

// ── state ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub zones: ZoneManager,
    pub clients: Option<watch::Receiver<Vec<ClientState>>>,
    pub catalog: Arc<dyn MediaCatalog>,
    pub events_tx: broadcast::Sender<StatusEvent>,
    pub api: Arc<ApiConfig>,
    pub health_enabled: bool,
    pub ready: watch::Receiver<bool>,
    pub limiter: Arc<RateLimiter>,
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "kind": self.0.kind(),
            "error": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

// ── rate limiting ─────────────────────────────────────────────────────────────

/// Token bucket per caller key.
pub struct RateLimiter {
    per_second: f64,
    buckets: Mutex<HashMap<String, (f64, Instant)>>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Arc<Self> {
        Arc::new(Self {
            per_second: f64::from(per_second.max(1)),
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// True when the caller may proceed.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let (tokens, last) = buckets
            .entry(key.to_string())
            .or_insert((self.per_second, now));
        let refill = now.duration_since(*last).as_secs_f64() * self.per_second;
        *tokens = (*tokens + refill).min(self.per_second);
        *last = now;
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ── guards ────────────────────────────────────────────────────────────────────

fn api_key_of(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

/// Auth + rate-limit gate for API routes.  Returns the caller key used for
/// rate accounting.
fn check_access(
    state: &AppState,
    headers: &HeaderMap,
    peer: &SocketAddr,
) -> std::result::Result<(), Response> {
    let caller = if state.api.auth_enabled {
        match api_key_of(headers) {
            Some(key) if state.api.api_keys.iter().any(|k| k == key) => key.to_string(),
            _ => {
                return Err((
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({ "error": "missing or invalid API key" })),
                )
                    .into_response());
            }
        }
    } else {
        peer.ip().to_string()
    };

    if !state.limiter.allow(&caller) {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "rate limit exceeded" })),
        )
            .into_response());
    }
    Ok(())
}

async fn guard(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    if let Err(denied) = check_access(&state, request.headers(), &peer) {
        return denied;
    }
    next.run(request).await
}

// ── request bodies ────────────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct VolumeBody {
    value: u8,
}

#[derive(Debug, serde::Deserialize)]
struct SeekBody {
    ms: Option<u64>,
    progress: Option<f32>,
}

#[derive(Debug, serde::Deserialize)]
struct ZoneBody {
    zone: usize,
}

#[derive(Debug, serde::Deserialize)]
struct LatencyBody {
    ms: i32,
}

#[derive(Debug, serde::Deserialize)]
struct PlaylistBody {
    id: String,
}

/// `{"enabled": bool}` or the string `"toggle"`.
fn mute_command_from_body(zone: usize, body: &serde_json::Value) -> Result<Command> {
    if body.as_str() == Some("toggle") {
        return Ok(Command::ToggleMute { zone });
    }
    match body.get("enabled").and_then(|v| v.as_bool()) {
        Some(muted) => Ok(Command::SetMute { zone, muted }),
        None => Err(Error::protocol("expected {\"enabled\": bool} or \"toggle\"")),
    }
}

fn seek_command_from_body(zone: usize, body: &SeekBody) -> Result<Command> {
    match (body.ms, body.progress) {
        (Some(ms), None) => Ok(Command::SeekMs { zone, ms }),
        (None, Some(progress)) if (0.0..=1.0).contains(&progress) => {
            Ok(Command::SeekProgress { zone, progress })
        }
        (None, Some(_)) => Err(Error::protocol("progress must be within 0..1")),
        _ => Err(Error::protocol("exactly one of ms or progress is required")),
    }
}

// ── handlers ──────────────────────────────────────────────────────────────────

async fn dispatch(state: &AppState, command: Command) -> Result<()> {
    state
        .dispatcher
        .dispatch(CommandEnvelope::new(CommandSource::Http, command))
        .await
}

async fn list_zones(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.zones.snapshots()))
}

async fn get_zone(
    State(state): State<AppState>,
    Path(zone): Path<usize>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state
        .zones
        .snapshot(zone)
        .ok_or_else(|| Error::not_found(format!("zone {zone}")))?;
    Ok(Json(serde_json::json!(snapshot)))
}

async fn zone_transport(
    State(state): State<AppState>,
    Path((zone, action)): Path<(usize, String)>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let command = match action.as_str() {
        "play" => Command::Play { zone, track: None },
        "pause" => Command::Pause { zone },
        "stop" => Command::Stop { zone },
        "next" => Command::Next { zone },
        "previous" => Command::Prev { zone },
        other => return Err(Error::not_found(format!("action '{other}'")).into()),
    };
    dispatch(&state, command).await?;
    let snapshot = state
        .zones
        .snapshot(zone)
        .ok_or_else(|| Error::not_found(format!("zone {zone}")))?;
    Ok(Json(serde_json::json!(snapshot)))
}

async fn put_zone_volume(
    State(state): State<AppState>,
    Path(zone): Path<usize>,
    Json(body): Json<VolumeBody>,
) -> std::result::Result<StatusCode, ApiError> {
    if body.value > 100 {
        return Err(Error::protocol("volume must be within 0..100").into());
    }
    dispatch(&state, Command::SetVolume { zone, volume: body.value }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_zone_mute(
    State(state): State<AppState>,
    Path(zone): Path<usize>,
    Json(body): Json<serde_json::Value>,
) -> std::result::Result<StatusCode, ApiError> {
    let command = mute_command_from_body(zone, &body)?;
    dispatch(&state, command).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_zone_seek(
    State(state): State<AppState>,
    Path(zone): Path<usize>,
    Json(body): Json<SeekBody>,
) -> std::result::Result<StatusCode, ApiError> {
    let command = seek_command_from_body(zone, &body)?;
    dispatch(&state, command).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_zone_playlists(
    State(state): State<AppState>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let playlists = state.catalog.playlists().await?;
    Ok(Json(serde_json::json!(playlists)))
}

async fn put_zone_playlist(
    State(state): State<AppState>,
    Path(zone): Path<usize>,
    Json(body): Json<PlaylistBody>,
) -> std::result::Result<StatusCode, ApiError> {
    dispatch(&state, Command::SelectPlaylist { zone, id: body.id }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_clients(State(state): State<AppState>) -> Json<serde_json::Value> {
    let clients = state
        .clients
        .as_ref()
        .map(|rx| rx.borrow().clone())
        .unwrap_or_default();
    Json(serde_json::json!(clients))
}

fn parse_mac(raw: &str) -> Result<ClientMac> {
    raw.parse().map_err(Error::protocol)
}

async fn put_client_volume(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Json(body): Json<VolumeBody>,
) -> std::result::Result<StatusCode, ApiError> {
    let mac = parse_mac(&mac)?;
    dispatch(&state, Command::SetClientVolume { mac, volume: body.value }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_client_mute(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> std::result::Result<StatusCode, ApiError> {
    let mac = parse_mac(&mac)?;
    let command = if body.as_str() == Some("toggle") {
        Command::ToggleClientMute { mac }
    } else {
        match body.get("enabled").and_then(|v| v.as_bool()) {
            Some(muted) => Command::SetClientMute { mac, muted },
            None => {
                return Err(Error::protocol("expected {\"enabled\": bool} or \"toggle\"").into())
            }
        }
    };
    dispatch(&state, command).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_client_zone(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Json(body): Json<ZoneBody>,
) -> std::result::Result<StatusCode, ApiError> {
    let mac = parse_mac(&mac)?;
    dispatch(&state, Command::AssignClientToZone { mac, zone: body.zone }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_client_latency(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Json(body): Json<LatencyBody>,
) -> std::result::Result<StatusCode, ApiError> {
    let mac = parse_mac(&mac)?;
    dispatch(&state, Command::SetClientLatency { mac, latency_ms: body.ms }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sse_events(State(state): State<AppState>) -> impl IntoResponse {
    let stream = tokio_stream::wrappers::BroadcastStream::new(state.events_tx.subscribe())
        .filter_map(|event| async move {
            let event = event.ok()?;
            SseEvent::default()
                .event(event.event_type())
                .json_data(&event)
                .ok()
                .map(Ok::<_, std::convert::Infallible>)
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn healthz(State(state): State<AppState>) -> Response {
    if !state.health_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn readyz(State(state): State<AppState>) -> Response {
    if !state.health_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    if *state.ready.borrow() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not ready" })),
        )
            .into_response()
    }
}

// ── router / server ───────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/zones", get(list_zones))
        .route("/zones/{zone}", get(get_zone))
        .route("/zones/{zone}/{action}", post(zone_transport))
        .route("/zones/{zone}/volume", put(put_zone_volume))
        .route("/zones/{zone}/mute", put(put_zone_mute))
        .route("/zones/{zone}/seek", put(put_zone_seek))
        .route("/zones/{zone}/playlists", get(get_zone_playlists))
        .route("/zones/{zone}/playlist", put(put_zone_playlist))
        .route("/clients", get(list_clients))
        .route("/clients/{mac}/volume", put(put_client_volume))
        .route("/clients/{mac}/mute", put(put_client_mute))
        .route("/clients/{mac}/zone", put(put_client_zone))
        .route("/clients/{mac}/latency", put(put_client_latency))
        .route("/events", get(sse_events))
        .layer(axum::middleware::from_fn_with_state(state.clone(), guard));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(api)
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    state: AppState,
    bind_address: String,
    port: u16,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let app = router(state);
    tokio::spawn(async move {
        let addr = format!("{bind_address}:{port}");
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("http: failed to bind {addr}: {e}");
                return;
            }
        };
        info!("http: API listening on {addr}");
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await });
        if let Err(e) = serve.await {
            warn!("http: server error: {e}");
        }
    })
}
