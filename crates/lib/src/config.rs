//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.subecho/config.json`), then environment
//! overrides are applied. CLI flags are applied last by the caller.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::negotiate::{AllowList, NegotiationPolicy};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Subprotocol allow-list and policy.
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// Per-connection session behavior (gating, echo style, timers).
    #[serde(default)]
    pub session: SessionConfig,

    /// Client harness target and scenarios.
    #[serde(default)]
    pub harness: HarnessConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: bearer token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require `Authorization: Bearer`.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for the upgrade request. Overridden by SUBECHO_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require `Authorization: Bearer <token>` on the upgrade request.
    Token,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Allow-list and what to do when nothing in it was offered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationConfig {
    /// Subprotocols the server accepts. Case-sensitive; duplicates are collapsed.
    #[serde(default = "default_allow_list")]
    pub allow_list: Vec<String>,

    /// "permissive" (default) or "strict".
    #[serde(default)]
    pub policy: NegotiationPolicy,
}

fn default_allow_list() -> Vec<String> {
    [
        "graphql-ws",
        "graphql-transport-ws",
        "json",
        "custom-proto-1",
        "synapse-contentType-application-json",
        "synapse-contentType_application_json",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            allow_list: default_allow_list(),
            policy: NegotiationPolicy::default(),
        }
    }
}

impl NegotiationConfig {
    pub fn allow_list(&self) -> AllowList {
        AllowList::new(self.allow_list.iter().cloned())
    }
}

/// Whether periodic pushes need a trigger phrase first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GatingMode {
    /// Session is active as soon as it opens; no periodic pushes.
    #[default]
    None,
    /// Session waits for the trigger phrase, then starts periodic pushes.
    #[serde(alias = "trigger-phrase")]
    TriggerPhrase,
}

/// How non-query messages are echoed back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EchoStyle {
    /// Send the received text back verbatim.
    #[default]
    Raw,
    /// Wrap as `{"type":"echo","message":...}`.
    Envelope,
}

/// Session knobs. One config covers the plain echo, strict and gated server variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub gating: GatingMode,

    /// Compared against trimmed incoming text, case-insensitively.
    #[serde(default = "default_trigger_phrase")]
    pub trigger_phrase: String,

    #[serde(default)]
    pub echo_style: EchoStyle,

    /// Negotiated protocol whose messages are answered with a GQL_ACK envelope.
    #[serde(default = "default_query_protocol")]
    pub query_protocol: String,

    /// Liveness ping interval in milliseconds (default 10000).
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Periodic push interval in milliseconds once gating is active (default 2000).
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,
}

fn default_trigger_phrase() -> String {
    "authenticate".to_string()
}

fn default_query_protocol() -> String {
    "graphql-ws".to_string()
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

fn default_push_interval_ms() -> u64 {
    2_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gating: GatingMode::default(),
            trigger_phrase: default_trigger_phrase(),
            echo_style: EchoStyle::default(),
            query_protocol: default_query_protocol(),
            probe_interval_ms: default_probe_interval_ms(),
            push_interval_ms: default_push_interval_ms(),
        }
    }
}

/// One harness scenario: a name and the subprotocols to offer (absent = send no header).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    pub name: String,
    #[serde(default)]
    pub protocols: Option<Vec<String>>,
    /// Per-scenario endpoint; falls back to `harness.url`.
    #[serde(default)]
    pub url: Option<String>,
}

impl ScenarioConfig {
    pub fn new(name: impl Into<String>, protocols: Option<&[&str]>) -> Self {
        Self {
            name: name.into(),
            protocols: protocols.map(|p| p.iter().map(|s| s.to_string()).collect()),
            url: None,
        }
    }
}

/// Client harness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    #[serde(default = "default_harness_url")]
    pub url: String,

    /// Bearer token sent on every upgrade request. Falls back to SUBECHO_GATEWAY_TOKEN.
    #[serde(default)]
    pub token: Option<String>,

    /// Delay between the first reply and the client-initiated close.
    #[serde(default = "default_close_delay_ms")]
    pub close_delay_ms: u64,

    /// Bound on the wait for the first reply; 0 waits forever.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    #[serde(default = "default_scenarios")]
    pub scenarios: Vec<ScenarioConfig>,
}

fn default_harness_url() -> String {
    format!("ws://127.0.0.1:{}/ws", default_gateway_port())
}

fn default_close_delay_ms() -> u64 {
    200
}

fn default_reply_timeout_ms() -> u64 {
    10_000
}

/// The negotiation edge cases exercised by default.
pub fn default_scenarios() -> Vec<ScenarioConfig> {
    vec![
        ScenarioConfig::new("Single-valid", Some(&["json"])),
        ScenarioConfig::new(
            "All-supported",
            Some(&["graphql-ws", "graphql-transport-ws", "json"]),
        ),
        ScenarioConfig::new(
            "Multiple-with-supported",
            Some(&["foo", "graphql-transport-ws", "bar", "json"]),
        ),
        ScenarioConfig::new("All-unsupported", Some(&["foo", "bar"])),
        ScenarioConfig::new("No-protocol", None),
        ScenarioConfig::new(
            "Custom-content-type",
            Some(&["synapse-contentType-application-json"]),
        ),
        ScenarioConfig::new(
            "Custom-proto-sanitized",
            Some(&["synapse-contentType_application_json"]),
        ),
    ]
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            url: default_harness_url(),
            token: None,
            close_delay_ms: default_close_delay_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            scenarios: default_scenarios(),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the gateway token: env SUBECHO_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_nonempty("SUBECHO_GATEWAY_TOKEN").or_else(|| {
        config
            .gateway
            .auth
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the token the harness sends: harness.token, else the gateway token.
pub fn resolve_harness_token(config: &Config) -> Option<String> {
    config
        .harness
        .token
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| resolve_gateway_token(config))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Parse a policy name as used on the command line and in env ("permissive" | "strict").
pub fn parse_policy(s: &str) -> Option<NegotiationPolicy> {
    match s.trim().to_lowercase().as_str() {
        "permissive" => Some(NegotiationPolicy::Permissive),
        "strict" => Some(NegotiationPolicy::Strict),
        _ => None,
    }
}

/// Parse a gating mode ("none" | "trigger-phrase"; "triggerPhrase" also accepted).
pub fn parse_gating(s: &str) -> Option<GatingMode> {
    match s.trim().to_lowercase().as_str() {
        "none" => Some(GatingMode::None),
        "trigger-phrase" | "triggerphrase" | "trigger_phrase" => Some(GatingMode::TriggerPhrase),
        _ => None,
    }
}

/// Apply SUBECHO_* environment overrides on top of file config.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(port) = env_nonempty("SUBECHO_PORT") {
        config.gateway.port = port
            .parse()
            .with_context(|| format!("parsing SUBECHO_PORT={}", port))?;
    }
    if let Some(list) = env_nonempty("SUBECHO_ALLOW_LIST") {
        config.negotiation.allow_list = list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(policy) = env_nonempty("SUBECHO_POLICY") {
        config.negotiation.policy = parse_policy(&policy)
            .with_context(|| format!("unknown SUBECHO_POLICY: {}", policy))?;
    }
    if let Some(gating) = env_nonempty("SUBECHO_GATING") {
        config.session.gating = parse_gating(&gating)
            .with_context(|| format!("unknown SUBECHO_GATING: {}", gating))?;
    }
    if let Some(phrase) = env_nonempty("SUBECHO_TRIGGER_PHRASE") {
        config.session.trigger_phrase = phrase;
    }
    if let Some(ms) = env_nonempty("SUBECHO_PROBE_INTERVAL_MS") {
        config.session.probe_interval_ms = ms
            .parse()
            .with_context(|| format!("parsing SUBECHO_PROBE_INTERVAL_MS={}", ms))?;
    }
    if let Some(ms) = env_nonempty("SUBECHO_PUSH_INTERVAL_MS") {
        config.session.push_interval_ms = ms
            .parse()
            .with_context(|| format!("parsing SUBECHO_PUSH_INTERVAL_MS={}", ms))?;
    }
    Ok(())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SUBECHO_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".subecho").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the default path (or SUBECHO_CONFIG_PATH). Missing file => default config.
/// Environment overrides are applied. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config)?;
    Ok((config, path))
}
