//! End-to-end: gateway on a free port, harness scenarios and raw WebSocket clients against it.

use futures_util::{SinkExt, StreamExt};
use lib::config::{Config, GatewayAuthMode, GatingMode, HarnessConfig, ScenarioConfig};
use lib::gateway;
use lib::harness::{Harness, Outcome};
use lib::negotiate::NegotiationPolicy;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct RunningGateway {
    port: u16,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl RunningGateway {
    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.handle).await;
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn start_gateway(mut config: Config) -> RunningGateway {
    let port = free_port();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        gateway::run_gateway_with_shutdown(config, async {
            let _ = stop_rx.await;
        })
        .await
    });

    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return RunningGateway {
                port,
                stop: Some(stop_tx),
                handle,
            };
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway did not start listening on port {}", port);
}

fn harness_for(url: String, scenarios: Vec<ScenarioConfig>) -> Harness {
    Harness::new(HarnessConfig {
        url,
        token: None,
        close_delay_ms: 10,
        reply_timeout_ms: 5_000,
        scenarios,
    })
}

async fn connect_raw(url: &str, protocols: Option<&str>) -> Client {
    let mut request = url.into_client_request().expect("request");
    if let Some(p) = protocols {
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_str(p).expect("header"));
    }
    let (ws, _) = connect_async(request).await.expect("connect");
    ws
}

/// Next data or close frame, skipping pings and pongs.
async fn next_frame(ws: &mut Client) -> Message {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("stream open")
            .expect("frame ok");
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn next_json(ws: &mut Client) -> serde_json::Value {
    match next_frame(ws).await {
        Message::Text(text) => serde_json::from_str(&text).expect("json frame"),
        other => panic!("expected text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn first_allowed_offer_in_client_order_is_negotiated() {
    let mut config = Config::default();
    config.negotiation.allow_list = vec!["json".to_string(), "graphql-transport-ws".to_string()];
    let gw = start_gateway(config).await;

    let mut ws = connect_raw(&gw.url(), Some("foo, graphql-transport-ws, bar, json")).await;
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["protocol"], "graphql-transport-ws");
    assert!(welcome["time"].as_str().is_some());
    ws.close(None).await.ok();

    let harness = harness_for(
        gw.url(),
        vec![ScenarioConfig::new(
            "Multiple-with-supported",
            Some(&["foo", "graphql-transport-ws", "bar", "json"]),
        )],
    );
    let report = harness.run().await;
    assert_eq!(
        report.results()[0].outcome,
        Outcome::Success("graphql-transport-ws".to_string())
    );

    gw.stop().await;
}

#[tokio::test]
async fn permissive_without_offer_succeeds_as_none() {
    let gw = start_gateway(Config::default()).await;

    let mut ws = connect_raw(&gw.url(), None).await;
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    assert!(welcome["protocol"].is_null());

    ws.send(Message::Text("ping me back".to_string())).await.unwrap();
    match next_frame(&mut ws).await {
        Message::Text(text) => assert_eq!(text, "ping me back"),
        other => panic!("expected echo, got {:?}", other),
    }
    ws.close(None).await.ok();

    let report = harness_for(gw.url(), vec![ScenarioConfig::new("No-protocol", None)])
        .run()
        .await;
    assert_eq!(report.results()[0].outcome, Outcome::Success("none".to_string()));

    gw.stop().await;
}

#[tokio::test]
async fn query_protocol_gets_structured_ack() {
    let gw = start_gateway(Config::default()).await;

    let mut ws = connect_raw(&gw.url(), Some("graphql-ws")).await;
    assert_eq!(next_json(&mut ws).await["protocol"], "graphql-ws");
    ws.send(Message::Text("{\"type\":\"GQL_START\"}".to_string()))
        .await
        .unwrap();
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "GQL_ACK");
    assert_eq!(ack["payload"], "{\"type\":\"GQL_START\"}");
    ws.close(None).await.ok();

    gw.stop().await;
}

#[tokio::test]
async fn strict_policy_closes_going_away_before_any_message() {
    let mut config = Config::default();
    config.negotiation.policy = NegotiationPolicy::Strict;
    let gw = start_gateway(config).await;

    let mut ws = connect_raw(&gw.url(), None).await;
    match next_frame(&mut ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1001);
            assert!(frame.reason.contains("unsupported"));
        }
        other => panic!("expected close before any message, got {:?}", other),
    }

    let report = harness_for(
        gw.url(),
        vec![
            ScenarioConfig::new("No-protocol", None),
            ScenarioConfig::new("All-unsupported", Some(&["foo", "bar"])),
            ScenarioConfig::new("Single-valid", Some(&["json"])),
        ],
    )
    .run()
    .await;

    match &report.results()[0].outcome {
        Outcome::Failure(reason) => {
            assert!(reason.starts_with("Server closed: code=1001"), "{}", reason)
        }
        other => panic!("expected failure, got {:?}", other),
    }
    match &report.results()[1].outcome {
        Outcome::Failure(reason) => {
            assert!(reason.starts_with("Server closed: code=1001"), "{}", reason);
            assert!(reason.contains("unsupported"), "{}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.results()[2].outcome, Outcome::Success("json".to_string()));
    assert_eq!(report.failures(), 2);

    gw.stop().await;
}

#[tokio::test]
async fn permissive_unsupported_offer_is_not_negotiated() {
    let gw = start_gateway(Config::default()).await;

    let report = harness_for(
        gw.url(),
        vec![ScenarioConfig::new("All-unsupported", Some(&["foo", "bar"]))],
    )
    .run()
    .await;
    assert_eq!(
        report.results()[0].outcome,
        Outcome::Failure("No subprotocol negotiated (unsupported)".to_string())
    );

    gw.stop().await;
}

#[tokio::test]
async fn trigger_phrase_gates_periodic_pushes() {
    let mut config = Config::default();
    config.session.gating = GatingMode::TriggerPhrase;
    config.session.push_interval_ms = 50;
    let gw = start_gateway(config).await;

    let mut ws = connect_raw(&gw.url(), Some("json")).await;
    assert_eq!(next_json(&mut ws).await["type"], "welcome");

    ws.send(Message::Text("hello".to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "error");

    // No pushes while still awaiting the trigger.
    let quiet = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(quiet.is_err(), "unexpected frame before trigger: {:?}", quiet);

    ws.send(Message::Text("  AUTHENTICATE ".to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "auth_ack");

    let push = next_json(&mut ws).await;
    assert_eq!(push["type"], "server-message");
    assert!(push["timestamp"].as_str().is_some());
    ws.close(None).await.ok();

    gw.stop().await;
}

#[tokio::test]
async fn token_mode_rejects_missing_or_wrong_bearer() {
    if std::env::var("SUBECHO_GATEWAY_TOKEN").is_ok() {
        return;
    }
    let mut config = Config::default();
    config.gateway.auth.mode = GatewayAuthMode::Token;
    config.gateway.auth.token = Some("s3cret".to_string());
    let gw = start_gateway(config).await;

    let scenarios = vec![ScenarioConfig::new("Single-valid", Some(&["json"]))];
    let denied = harness_for(gw.url(), scenarios.clone())
        .with_token(Some("wrong".to_string()))
        .run()
        .await;
    match &denied.results()[0].outcome {
        Outcome::Failure(reason) => assert!(reason.starts_with("Handshake failed"), "{}", reason),
        other => panic!("expected handshake failure, got {:?}", other),
    }

    let allowed = harness_for(gw.url(), scenarios)
        .with_token(Some("s3cret".to_string()))
        .run()
        .await;
    assert_eq!(allowed.results()[0].outcome, Outcome::Success("json".to_string()));

    gw.stop().await;
}

#[tokio::test]
async fn shutdown_closes_live_sessions_going_away() {
    let mut gw = start_gateway(Config::default()).await;

    let mut ws = connect_raw(&gw.url(), Some("json")).await;
    assert_eq!(next_json(&mut ws).await["type"], "welcome");

    if let Some(stop) = gw.stop.take() {
        let _ = stop.send(());
    }
    match next_frame(&mut ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1001);
            assert_eq!(frame.reason, "Server shutting down");
        }
        other => panic!("expected shutdown close, got {:?}", other),
    }
    while let Ok(Some(Ok(_))) = tokio::time::timeout(Duration::from_secs(2), ws.next()).await {}

    let result = tokio::time::timeout(Duration::from_secs(5), &mut gw.handle)
        .await
        .expect("gateway stops")
        .expect("gateway task joined");
    assert!(result.is_ok(), "{:?}", result);
}
