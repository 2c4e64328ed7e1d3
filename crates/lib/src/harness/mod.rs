//! Client harness: runs named negotiation scenarios one at a time against an endpoint
//! and classifies how each connection ended.
//!
//! Per scenario: connect offering the scenario's subprotocols, send a probe suited to the
//! negotiated protocol, wait for one reply, close normally after a short delay, then
//! classify the observed close.

mod classify;
mod report;

pub use classify::{classify, Outcome};
pub use report::{HarnessReport, OutcomeRecorder, ScenarioResult};

use crate::config::{self, Config, HarnessConfig, ScenarioConfig};
use crate::error::EchoError;
use crate::gateway::protocol::CLOSE_ABNORMAL;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on waiting for the server's close reply after we close.
const CLOSE_WAIT: Duration = Duration::from_secs(5);
/// Bound on draining the stream after the server closed first.
const DRAIN_WAIT: Duration = Duration::from_secs(1);
/// "No status received": close frame without a code.
const CLOSE_NO_STATUS: u16 = 1005;

/// Probe text for a negotiated protocol: a query for the query protocol, a JSON ping
/// for `json`, a plain greeting otherwise.
pub fn probe_payload(negotiated: Option<&str>, scenario: &str, query_protocol: &str) -> String {
    match negotiated {
        Some(p) if p == query_protocol => {
            serde_json::json!({ "type": "GQL_START", "payload": { "query": "{ test }" } })
                .to_string()
        }
        Some("json") => serde_json::json!({ "event": "ping" }).to_string(),
        _ => format!("Hello from client ({})", scenario),
    }
}

/// Build the upgrade request: one `Sec-WebSocket-Protocol` header with all offers, plus
/// an optional bearer token.
pub fn build_request(
    url: &str,
    protocols: &[String],
    token: Option<&str>,
) -> Result<Request, EchoError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| EchoError::HarnessConnect(e.to_string()))?;
    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| EchoError::HarnessConnect(format!("invalid protocol list: {}", e)))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| EchoError::HarnessConnect(format!("invalid token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

enum Step {
    Reply(String),
    Closed { code: u16, reason: String },
}

fn close_info(frame: Option<CloseFrame<'_>>) -> (u16, String) {
    frame
        .map(|f| (u16::from(f.code), f.reason.into_owned()))
        .unwrap_or((CLOSE_NO_STATUS, String::new()))
}

async fn read_until_reply(ws: &mut WsStream) -> Step {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Step::Reply(text),
            Ok(Message::Binary(bytes)) => {
                return Step::Reply(String::from_utf8_lossy(&bytes).into_owned())
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = close_info(frame);
                return Step::Closed { code, reason };
            }
            Ok(_) => continue,
            Err(e) => {
                return Step::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: e.to_string(),
                }
            }
        }
    }
    Step::Closed {
        code: CLOSE_ABNORMAL,
        reason: String::new(),
    }
}

/// After our close frame: skip remaining data frames until the peer's close arrives.
async fn read_until_close(ws: &mut WsStream) -> (u16, String) {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Close(frame)) => return close_info(frame),
            Ok(_) => continue,
            Err(e) => return (CLOSE_ABNORMAL, e.to_string()),
        }
    }
    (CLOSE_ABNORMAL, String::new())
}

/// Keep polling so the transport flushes its close reply, then let the stream end.
async fn drain(ws: &mut WsStream) {
    let _ = tokio::time::timeout(DRAIN_WAIT, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

fn log_reply(text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(parsed) => log::info!("received JSON: {}", parsed),
        Err(_) => log::info!("received: {}", text),
    }
}

/// Runs scenarios strictly one after another; owns the result log for the run.
pub struct Harness {
    config: HarnessConfig,
    token: Option<String>,
    query_protocol: String,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        let token = config
            .token
            .as_ref()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Self {
            config,
            token,
            query_protocol: config::SessionConfig::default().query_protocol,
        }
    }

    /// Harness settings plus the token and query protocol resolved from the full config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            config: config.harness.clone(),
            token: config::resolve_harness_token(config),
            query_protocol: config.session.query_protocol.clone(),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Run every configured scenario in order and return the report.
    pub async fn run(&self) -> HarnessReport {
        let mut report = HarnessReport::default();
        for scenario in &self.config.scenarios {
            let result = self.run_scenario(scenario).await;
            report.push(result);
        }
        report
    }

    /// Run one scenario to completion. Exactly one result is produced.
    pub async fn run_scenario(&self, scenario: &ScenarioConfig) -> ScenarioResult {
        let requested = scenario.protocols.clone().unwrap_or_default();
        let url = scenario.url.as_deref().unwrap_or(&self.config.url);
        log::info!("--- Test: {} ---", scenario.name);
        log::info!(
            "connecting to {} requesting [{}]",
            url,
            if requested.is_empty() {
                "(none)".to_string()
            } else {
                requested.join(", ")
            }
        );

        let mut recorder = OutcomeRecorder::default();
        match self.connect(url, &requested).await {
            Err(e) => {
                log::warn!("{}: {}", scenario.name, e);
                recorder.record(Outcome::Failure(e.to_string()));
            }
            Ok((ws, negotiated)) => {
                self.exchange(ws, scenario, &requested, negotiated, &mut recorder)
                    .await;
            }
        }
        recorder.finish(scenario.name.clone(), requested)
    }

    async fn connect(
        &self,
        url: &str,
        requested: &[String],
    ) -> Result<(WsStream, Option<String>), EchoError> {
        let request = build_request(url, requested, self.token.as_deref())?;
        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| EchoError::HarnessConnect(e.to_string()))?;
        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok((ws, negotiated))
    }

    async fn exchange(
        &self,
        mut ws: WsStream,
        scenario: &ScenarioConfig,
        requested: &[String],
        negotiated: Option<String>,
        recorder: &mut OutcomeRecorder,
    ) {
        log::info!(
            "connection open; negotiated subprotocol: {}",
            negotiated.as_deref().unwrap_or("(none)")
        );
        if !requested.is_empty() {
            match negotiated.as_deref() {
                None => log::warn!("no subprotocol was negotiated despite being requested"),
                Some(p) if !requested.iter().any(|r| r == p) => log::warn!(
                    "negotiated subprotocol ({}) wasn't among requested: [{}]",
                    p,
                    requested.join(", ")
                ),
                Some(_) => {}
            }
        }

        let probe = probe_payload(negotiated.as_deref(), &scenario.name, &self.query_protocol);
        if let Err(e) = ws.send(Message::Text(probe)).await {
            log::warn!("sending probe failed: {}", e);
        }

        let first = if self.config.reply_timeout_ms == 0 {
            read_until_reply(&mut ws).await
        } else {
            let limit = Duration::from_millis(self.config.reply_timeout_ms);
            match tokio::time::timeout(limit, read_until_reply(&mut ws)).await {
                Ok(step) => step,
                Err(_) => {
                    log::warn!("{}: no reply within {:?}", scenario.name, limit);
                    recorder.record(Outcome::Failure("timeout".to_string()));
                    let _ = ws.send(Message::Close(None)).await;
                    return;
                }
            }
        };

        let (code, reason) = match first {
            Step::Reply(text) => {
                log_reply(&text);
                tokio::time::sleep(Duration::from_millis(self.config.close_delay_ms)).await;
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "Test complete".into(),
                };
                if let Err(e) = ws.send(Message::Close(Some(frame))).await {
                    log::debug!("sending close failed: {}", e);
                }
                match tokio::time::timeout(CLOSE_WAIT, read_until_close(&mut ws)).await {
                    Ok(info) => info,
                    Err(_) => (CLOSE_ABNORMAL, "close handshake timed out".to_string()),
                }
            }
            Step::Closed { code, reason } => {
                drain(&mut ws).await;
                (code, reason)
            }
        };

        log::info!(
            "connection closed (code={}, reason={})",
            code,
            if reason.is_empty() { "(no reason)" } else { reason.as_str() }
        );
        recorder.record(classify(code, &reason, requested, negotiated.as_deref()));
    }
}
