//! Gateway WebSocket wire payloads (welcome, echo envelopes, gating, pushes) and close codes.

use serde::{Deserialize, Serialize};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Going away: used for shutdown and strict-policy rejection.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Abnormal closure (no close frame observed). Never sent on the wire.
pub const CLOSE_ABNORMAL: u16 = 1006;

pub const REASON_UNSUPPORTED: &str = "unsupported subprotocol";
pub const REASON_SHUTDOWN: &str = "Server shutting down";

/// JSON text frames sent by the server. `type` carries the variant tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First frame on every admitted connection. `protocol` is null when none was negotiated.
    #[serde(rename = "welcome")]
    Welcome {
        protocol: Option<String>,
        time: String,
    },
    /// Reply on the query protocol.
    #[serde(rename = "GQL_ACK")]
    GqlAck { payload: String },
    /// Envelope echo style.
    #[serde(rename = "echo")]
    Echo { message: String },
    /// Trigger phrase accepted; periodic pushes start.
    #[serde(rename = "auth_ack")]
    AuthAck { message: String },
    /// Message rejected by the gating contract.
    #[serde(rename = "error")]
    Error { message: String },
    /// Periodic push after gating is active.
    #[serde(rename = "server-message")]
    ServerMessage { message: String, timestamp: String },
}

/// Current UTC time as ISO-8601 with millisecond precision (e.g. `2024-05-01T12:00:00.000Z`).
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
