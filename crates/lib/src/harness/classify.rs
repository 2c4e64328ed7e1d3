//! Verdict for one scenario from what the client observed at close.

use crate::gateway::protocol::CLOSE_NORMAL;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Negotiated protocol, or "none".
    Success(String),
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(p) => write!(f, "subprotocol = {}", p),
            Outcome::Failure(reason) => f.write_str(reason),
        }
    }
}

/// Rules, first match wins:
/// 1. abnormal close code, or a reason mentioning "invalid"/"unsupported" -> server-closed failure;
/// 2. protocols were requested but none negotiated -> failure;
/// 3. otherwise success with the negotiated protocol (or "none").
pub fn classify(
    close_code: u16,
    close_reason: &str,
    requested: &[String],
    negotiated: Option<&str>,
) -> Outcome {
    let reason = close_reason.to_lowercase();
    if close_code != CLOSE_NORMAL || reason.contains("invalid") || reason.contains("unsupported") {
        return Outcome::Failure(format!(
            "Server closed: code={}, reason={}",
            close_code,
            if close_reason.is_empty() { "(none)" } else { close_reason }
        ));
    }
    match negotiated {
        None if !requested.is_empty() => {
            Outcome::Failure("No subprotocol negotiated (unsupported)".to_string())
        }
        Some(p) => Outcome::Success(p.to_string()),
        None => Outcome::Success("none".to_string()),
    }
}
