//! HTTP surface and admission pipeline
//!
//! `/ws` runs the admission gate in order: rate limit, parameter check, role
//! dispatch (hosts upload their verification key, guests are checked against
//! the bound one), capacity, then the WebSocket upgrade and hand-off to the
//! hub. Every rejection happens before the upgrade as a plain HTTP status.
//!
//! CORS is permissive because the relay is a data forwarding service.
//! Security comes from E2E encryption, not origin checking.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::auth::{self, AuthError, Claims};
use crate::config::RelayConfig;
use crate::connection::Connection;
use crate::hub::Hub;
use crate::rate_limit::RateLimiter;
use crate::room::{egress_channel, ClientHandle};

/// Socket read limit. Set well above the advisory message cap so oversized
/// frames disconnect nobody by accident; clients enforce their own ceiling.
const READ_LIMIT: usize = 50 * 1024 * 1024;

/// Bound on graceful shutdown once the token fires.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state behind the router.
pub struct AppState {
    pub hub: Hub,
    pub limiter: Arc<RateLimiter>,
    pub config: RelayConfig,
}

/// Admission failures, surfaced as HTTP statuses before the upgrade.
#[derive(Debug, Error)]
enum AdmissionError {
    #[error("missing room or token")]
    MissingParams,
    #[error("invalid pubkey")]
    InvalidPubkey,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] AuthError),
    #[error("room mismatch")]
    RoomMismatch,
    #[error("room not found")]
    RoomNotFound,
    #[error("max rooms reached")]
    MaxRooms,
    #[error("room full")]
    RoomFull,
}

impl AdmissionError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingParams | Self::InvalidPubkey => StatusCode::BAD_REQUEST,
            Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::RoomMismatch => StatusCode::FORBIDDEN,
            Self::RoomNotFound => StatusCode::NOT_FOUND,
            Self::MaxRooms | Self::RoomFull => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Build the relay's router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn index_handler() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

#[derive(Deserialize)]
struct WsQuery {
    room: Option<String>,
    token: Option<String>,
    pubkey: Option<String>,
}

async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let source = client_source(&headers, addr);

    if !state.limiter.allow(&source) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }

    let (Some(room_id), Some(token)) = (query.room, query.token) else {
        return AdmissionError::MissingParams.into_response();
    };

    // An empty pubkey parameter is treated as absent: only a real key
    // upload selects the host path.
    let pubkey = query.pubkey.as_deref().filter(|key| !key.is_empty());

    let claims = match admit(&state, &room_id, &token, pubkey) {
        Ok(claims) => claims,
        Err(err) => {
            warn!(room = %room_id, %source, "admission refused: {err}");
            return err.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        // Admission passed but the request cannot carry a WebSocket.
        Err(rejection) => return rejection.into_response(),
    };

    let hub = state.hub.clone();
    ws.max_message_size(READ_LIMIT)
        .on_upgrade(move |socket| async move {
            let (tx, rx) = egress_channel();
            let client = Arc::new(ClientHandle::new(
                room_id,
                claims.peer_id,
                claims.role,
                source,
            ));
            hub.register(Connection::new(socket, client, tx, rx)).await;
        })
}

/// Everything between the parameter check and the upgrade: role dispatch,
/// token validation, host-key binding, capacity.
fn admit(
    state: &AppState,
    room_id: &str,
    token: &str,
    pubkey: Option<&str>,
) -> Result<Claims, AdmissionError> {
    let claims = match pubkey {
        // Host path: the uploaded key verifies the host's own token, then
        // becomes the room's verification key for later guests.
        Some(encoded) => {
            let key = decode_host_key(encoded)?;
            let claims = auth::validate_token(token, &key)?;
            if claims.room_id != room_id {
                return Err(AdmissionError::RoomMismatch);
            }
            state.hub.bind_host_key(room_id, key);
            claims
        }
        // Guest path: no key upload; the room must already have one.
        None => {
            let key = state
                .hub
                .host_key(room_id)
                .ok_or(AdmissionError::RoomNotFound)?;
            let claims = auth::validate_token(token, &key)?;
            if claims.room_id != room_id {
                return Err(AdmissionError::RoomMismatch);
            }
            claims
        }
    };

    // Capacity comes after key binding on purpose: a host refused here
    // leaves a bound key behind, which its next attempt overwrites.
    if pubkey.is_some() {
        if state.hub.room_count() >= state.config.max_rooms {
            return Err(AdmissionError::MaxRooms);
        }
    } else if state.hub.member_count(room_id) >= state.config.max_clients_per_room {
        return Err(AdmissionError::RoomFull);
    }

    Ok(claims)
}

fn decode_host_key(encoded: &str) -> Result<[u8; 32], AdmissionError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| AdmissionError::InvalidPubkey)?;
    bytes.try_into().map_err(|_| AdmissionError::InvalidPubkey)
}

/// Rate-limit key for a request: proxy-reported address when present, the
/// socket peer otherwise.
fn client_source(headers: &HeaderMap, addr: SocketAddr) -> String {
    for name in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    addr.ip().to_string()
}

/// Serve the router, with TLS when configured, until shutdown.
pub async fn serve(state: Arc<AppState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state.config.bind_addr()?;
    let app = router(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>();

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
    }

    info!(
        %addr,
        max_rooms = state.config.max_rooms,
        max_clients_per_room = state.config.max_clients_per_room,
        max_message_size = state.config.max_message_size,
        "relay listening"
    );

    if let Some((cert, key)) = state.config.tls_pair() {
        let tls = tls_config(cert, key)?;
        info!(cert, "TLS enabled");
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app)
            .await?;
    } else {
        info!("TLS disabled (no cert/key configured)");
        axum_server::bind(addr).handle(handle).serve(app).await?;
    }
    Ok(())
}

/// TLS 1.3 only, operator-supplied PEM cert and key.
fn tls_config(cert_path: &str, key_path: &str) -> anyhow::Result<RustlsConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path).with_context(|| format!("open TLS certificate '{cert_path}'"))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("parse TLS certificate")?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path).with_context(|| format!("open TLS key '{key_path}'"))?,
    ))
    .context("parse TLS key")?
    .context("no private key found in TLS key file")?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 configuration")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS configuration")?;

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<title>Veil Relay</title>
<meta name="description" content="Stateless WebSocket relay for end-to-end encrypted Veil rooms">
<style>
*{margin:0;padding:0;box-sizing:border-box}
body{font-family:system-ui,-apple-system,sans-serif;background:#191919;color:#e5e5e5;
min-height:100vh;display:flex;align-items:center;justify-content:center;padding:24px}
.card{max-width:420px;text-align:center}
h1{font-size:18px;font-weight:600;margin-bottom:12px}
p{font-size:13px;color:#737373;line-height:1.6;margin-bottom:8px}
code{background:#242424;border:1px solid #333;border-radius:4px;padding:1px 5px;font-size:12px}
a{color:#dedacf}
</style>
</head>
<body>
<div class="card">
<h1>Veil Relay</h1>
<p>This server forwards end-to-end encrypted frames between members of a room.
It cannot read any of the traffic it relays.</p>
<p>Clients connect to <code>/ws</code> with a room-scoped, host-signed token.
Liveness: <a href="/health">/health</a></p>
</div>
</body>
</html>
"#;
