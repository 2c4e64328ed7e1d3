//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config, SessionConfig};
use crate::error::EchoError;
use crate::gateway::connections::ConnectionSet;
use crate::gateway::socket::{spawn_reader, spawn_writer, ChannelIo};
use crate::negotiate::{negotiate, parse_offered, AllowList, NegotiationPolicy, NegotiationResult};
use crate::session::{new_conn_id, Phase, Session};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::{
        header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a session waits for the peer's close frame after sending its own.
const CLOSE_GRACE: Duration = Duration::from_secs(5);
/// How long shutdown waits for sessions to finish their close handshake.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

/// Shared state for the gateway (negotiation settings, session config, live connections).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub allow_list: Arc<AllowList>,
    pub policy: NegotiationPolicy,
    pub session_config: Arc<SessionConfig>,
    /// When Some, the upgrade request must carry `Authorization: Bearer <token>`.
    pub required_token: Option<String>,
    pub connections: Arc<ConnectionSet>,
}

impl GatewayState {
    pub fn new(config: Config) -> Self {
        let required_token = require_connect_token(&config);
        Self {
            allow_list: Arc::new(config.negotiation.allow_list()),
            policy: config.negotiation.policy,
            session_config: Arc::new(config.session.clone()),
            required_token,
            connections: Arc::new(ConnectionSet::new()),
            config: Arc::new(config),
        }
    }
}

/// When auth mode is token and a token is configured, returns it for upgrade validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Build the router: `GET /` health, `GET /ws` upgrade; any other path also upgrades.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .fallback(ws_handler)
        .with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Blocks until shutdown (SIGINT or SIGTERM).
pub async fn run_gateway(config: Config) -> Result<()> {
    run_gateway_with_shutdown(config, shutdown_signal()).await
}

/// Like [`run_gateway`], but stops when `shutdown` completes instead of on a process signal.
pub async fn run_gateway_with_shutdown<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or SUBECHO_GATEWAY_TOKEN)",
                bind
            );
        }
    }
    if config.gateway.auth.mode == config::GatewayAuthMode::Token
        && config::resolve_gateway_token(&config).is_none()
    {
        anyhow::bail!("gateway.auth.mode is \"token\" but no token is configured");
    }

    let state = GatewayState::new(config);
    log::info!(
        "negotiation policy: {}; allow-list: [{}]",
        state.policy.as_str(),
        state.allow_list.iter().collect::<Vec<_>>().join(", ")
    );
    let connections = state.connections.clone();
    let port = state.config.gateway.port;
    let app = router(state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on ws://{}", bind_addr);

    let broadcast_to = connections.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let notified = broadcast_to.broadcast_shutdown().await;
            log::info!("shutting down; sent close to {} connection(s)", notified);
        })
        .await
        .context("gateway server exited")?;

    if !connections.wait_until_empty(SHUTDOWN_DRAIN).await {
        log::warn!(
            "{} connection(s) still open after shutdown drain",
            connections.len().await
        );
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing live connections");
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "policy": state.policy.as_str(),
        "allowList": state.allow_list.iter().collect::<Vec<_>>(),
    }))
}

fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
        .map(|t| t.trim() == expected)
        .unwrap_or(false)
}

/// Upgrade handler: bearer check, then negotiation. The selected protocol (if any) is the
/// only one handed to the transport, so the 101 response echoes exactly that choice.
async fn ws_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(ref expected) = state.required_token {
        if !bearer_matches(&headers, expected) {
            log::warn!("rejecting upgrade: {}", EchoError::Unauthorized);
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }

    let offered = parse_offered(
        headers
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    );
    let result = negotiate(&offered, &state.allow_list);
    match &result {
        NegotiationResult::Selected(p) => {
            log::debug!("offered [{}], selected {}", offered.join(", "), p)
        }
        NegotiationResult::Rejected if state.policy == NegotiationPolicy::Strict => {
            log::warn!(
                "{}",
                EchoError::UpgradeRejected {
                    offered: format!("[{}]", offered.join(", "))
                }
            )
        }
        NegotiationResult::Rejected => {
            log::debug!(
                "offered [{}], no match; continuing without protocol",
                offered.join(", ")
            )
        }
    }

    let ws = match result.protocol() {
        Some(p) => ws.protocols([p.to_string()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, result))
}

/// Drive one accepted connection: register it, run the session until closed, deregister.
async fn handle_socket(socket: WebSocket, state: GatewayState, negotiation: NegotiationResult) {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let mut id = new_conn_id();
    while !state.connections.insert(id.clone(), ev_tx.clone()).await {
        id = new_conn_id();
    }
    log::info!("[{}] new connection", id);

    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = spawn_writer(sink, out_rx, id.clone());
    let reader = spawn_reader(stream, ev_tx.clone());

    let io = ChannelIo::new(out_tx, ev_tx);
    let mut session = Session::new(
        id.clone(),
        negotiation,
        state.policy,
        state.session_config.clone(),
        io,
    );
    session.open();

    while !session.is_closed() {
        let event = if session.phase() == Phase::Closing {
            match tokio::time::timeout(CLOSE_GRACE, ev_rx.recv()).await {
                Ok(ev) => ev,
                Err(_) => {
                    log::debug!(
                        "[{}] peer did not answer close; dropping connection",
                        session.id()
                    );
                    break;
                }
            }
        } else {
            ev_rx.recv().await
        };
        let Some(event) = event else { break };
        session.handle(event);
    }

    state.connections.remove(&id).await;
    drop(session);
    drop(ev_rx);
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        log::debug!("[{}] writer still flushing after close", id);
    }
    if tokio::time::timeout(Duration::from_secs(1), reader).await.is_err() {
        log::debug!("[{}] reader still running after close", id);
    }
    log::debug!("[{}] connection finished", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_must_match_exactly() {
        let mut headers = HeaderMap::new();
        assert!(!bearer_matches(&headers, "secret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(bearer_matches(&headers, "secret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer other"));
        assert!(!bearer_matches(&headers, "secret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic secret"));
        assert!(!bearer_matches(&headers, "secret"));
    }

    #[test]
    fn token_required_only_in_token_mode() {
        let mut config = Config::default();
        config.gateway.auth.token = Some("secret".into());
        assert_eq!(require_connect_token(&config), None);
        config.gateway.auth.mode = config::GatewayAuthMode::Token;
        if std::env::var("SUBECHO_GATEWAY_TOKEN").is_err() {
            assert_eq!(require_connect_token(&config), Some("secret".to_string()));
        }
    }

    #[tokio::test]
    async fn non_loopback_without_token_is_refused() {
        let mut config = Config::default();
        config.gateway.bind = "0.0.0.0".into();
        config.gateway.port = 0;
        if std::env::var("SUBECHO_GATEWAY_TOKEN").is_ok() {
            return;
        }
        let err = run_gateway_with_shutdown(config, async {}).await.unwrap_err();
        assert!(err.to_string().contains("refusing to bind"));
    }
}
