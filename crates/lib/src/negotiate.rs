//! Subprotocol negotiation: pick the first client-offered protocol that the server allows.
//!
//! Pure decision only. The gateway performs the actual accept/close.

use serde::{Deserialize, Serialize};

/// Server-configured set of accepted subprotocols. Case-sensitive, no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    /// Build from configured entries; empty strings are dropped and later duplicates ignored.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for e in entries {
            let e = e.into();
            if e.is_empty() || out.contains(&e) {
                continue;
            }
            out.push(e);
        }
        Self { entries: out }
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.entries.iter().any(|e| e == protocol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of negotiation for one upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationResult {
    Selected(String),
    Rejected,
}

impl NegotiationResult {
    pub fn protocol(&self) -> Option<&str> {
        match self {
            NegotiationResult::Selected(p) => Some(p),
            NegotiationResult::Rejected => None,
        }
    }
}

/// What the server does when negotiation yields no protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationPolicy {
    /// Accept the connection with no protocol bound.
    #[default]
    Permissive,
    /// Accept at the transport layer, then close with 1001 before any application message.
    Strict,
}

impl NegotiationPolicy {
    /// Whether a session with this result may proceed to the welcome message.
    pub fn admits(&self, result: &NegotiationResult) -> bool {
        match self {
            NegotiationPolicy::Permissive => true,
            NegotiationPolicy::Strict => result.protocol().is_some(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationPolicy::Permissive => "permissive",
            NegotiationPolicy::Strict => "strict",
        }
    }
}

/// Return the first offered protocol present in the allow-list, in client order.
pub fn negotiate(offered: &[String], allow_list: &AllowList) -> NegotiationResult {
    offered
        .iter()
        .find(|p| allow_list.contains(p))
        .map(|p| NegotiationResult::Selected(p.clone()))
        .unwrap_or(NegotiationResult::Rejected)
}

/// Flatten `Sec-WebSocket-Protocol` header values into the ordered offered list.
/// Each value may hold several comma-separated tokens; blanks are dropped.
pub fn parse_offered<'a, I>(header_values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    header_values
        .into_iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
