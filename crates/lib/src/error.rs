//! Error kinds for gateway sessions and the client harness.
//!
//! Every variant is contained to a single connection; only listener bind failure
//! (reported through `anyhow` at startup) is fatal.

#[derive(Debug, thiserror::Error)]
pub enum EchoError {
    /// Strict policy and no mutually acceptable subprotocol.
    #[error("unsupported subprotocol (offered: {offered})")]
    UpgradeRejected { offered: String },
    #[error("unauthorized: missing or invalid bearer token")]
    Unauthorized,
    #[error("transport error: {0}")]
    Transport(String),
    /// Message that breaks the gating contract; answered, connection stays open.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Handshake failed: {0}")]
    HarnessConnect(String),
}

impl EchoError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        EchoError::Transport(err.to_string())
    }
}
