//! Per-connection session state machine.
//!
//! A session is created after the upgrade with the negotiation result, sends the welcome
//! (or the strict-policy close), and then reacts to [`SessionEvent`]s delivered in order
//! from a single per-connection queue. All I/O goes through [`SessionIo`], so the same
//! machine drives the real socket and the test fakes.

use crate::config::{EchoStyle, GatingMode, SessionConfig};
use crate::error::EchoError;
use crate::gateway::protocol::{
    now_iso8601, ServerMessage, CLOSE_GOING_AWAY, REASON_SHUTDOWN, REASON_UNSUPPORTED,
};
use crate::negotiate::{NegotiationPolicy, NegotiationResult};
use std::sync::Arc;
use std::time::Duration;

/// Opaque connection identifier (short random token).
pub type ConnId = String;

/// Generate a 6-character lowercase alphanumeric connection id.
pub fn new_conn_id() -> ConnId {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Recurring timers owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    LivenessProbe,
    PeriodicPush,
}

/// Outbound frame handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// Everything that can happen to a connection, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Text(String),
    Binary(Vec<u8>),
    Pong,
    Tick(TimerKind),
    /// Peer sent a close frame (code absent when the frame had none) or the stream ended.
    PeerClosed { code: Option<u16>, reason: String },
    TransportError(String),
    /// Server-wide shutdown broadcast.
    Shutdown,
}

/// Handle to a scheduled repeating task. `cancel` must tolerate repeated calls.
pub trait TimerHandle {
    fn cancel(&self);
}

/// Transport capabilities a session needs.
pub trait SessionIo {
    type Timer: TimerHandle;

    /// Queue a frame for the peer.
    fn send(&mut self, frame: Frame) -> Result<(), EchoError>;

    /// Whether the transport still accepts writes.
    fn is_open(&self) -> bool;

    /// Start a timer that delivers `SessionEvent::Tick(kind)` every `every`.
    fn start_timer(&mut self, kind: TimerKind, every: Duration) -> Self::Timer;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gating {
    AwaitingTrigger,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    /// We sent a close frame and wait for the peer's.
    Closing,
    Closed,
}

pub struct Session<IO: SessionIo> {
    id: ConnId,
    negotiation: NegotiationResult,
    policy: NegotiationPolicy,
    config: Arc<SessionConfig>,
    gating: Gating,
    phase: Phase,
    io: IO,
    timers: Vec<(TimerKind, IO::Timer)>,
    pongs: u64,
    pushes: u64,
}

impl<IO: SessionIo> Session<IO> {
    pub fn new(
        id: ConnId,
        negotiation: NegotiationResult,
        policy: NegotiationPolicy,
        config: Arc<SessionConfig>,
        io: IO,
    ) -> Self {
        let gating = match config.gating {
            GatingMode::None => Gating::Active,
            GatingMode::TriggerPhrase => Gating::AwaitingTrigger,
        };
        Self {
            id,
            negotiation,
            policy,
            config,
            gating,
            phase: Phase::Open,
            io,
            timers: Vec::new(),
            pongs: 0,
            pushes: 0,
        }
    }

    /// Post-accept transition: welcome + liveness probe, or the strict-policy close.
    pub fn open(&mut self) {
        if !self.policy.admits(&self.negotiation) {
            log::warn!(
                "[{}] no acceptable subprotocol under strict policy; closing with {}",
                self.id,
                CLOSE_GOING_AWAY
            );
            self.close(CLOSE_GOING_AWAY, REASON_UNSUPPORTED);
            return;
        }
        log::info!(
            "[{}] negotiated subprotocol: {}",
            self.id,
            self.protocol().unwrap_or("(none)")
        );
        let welcome = ServerMessage::Welcome {
            protocol: self.protocol().map(String::from),
            time: now_iso8601(),
        };
        self.send_json(&welcome);
        self.start_timer(TimerKind::LivenessProbe, self.config.probe_interval_ms);
    }

    /// Apply one event. Events after `Closed` are ignored.
    pub fn handle(&mut self, event: SessionEvent) {
        if self.phase == Phase::Closed {
            return;
        }
        match event {
            SessionEvent::Text(text) => self.on_message(text),
            SessionEvent::Binary(bytes) => {
                self.on_message(String::from_utf8_lossy(&bytes).into_owned())
            }
            SessionEvent::Pong => {
                self.pongs += 1;
                log::debug!("[{}] pong received", self.id);
            }
            SessionEvent::Tick(kind) => self.on_tick(kind),
            SessionEvent::PeerClosed { code, reason } => {
                log::info!(
                    "[{}] connection closed (code={}, reason={})",
                    self.id,
                    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
                    if reason.is_empty() { "(none)" } else { reason.as_str() }
                );
                self.finish();
            }
            SessionEvent::TransportError(err) => {
                log::warn!("[{}] {}", self.id, EchoError::Transport(err));
                self.finish();
            }
            SessionEvent::Shutdown => self.close(CLOSE_GOING_AWAY, REASON_SHUTDOWN),
        }
    }

    /// Locally initiated close. Only the first call sends a close frame.
    pub fn close(&mut self, code: u16, reason: &str) {
        if self.phase != Phase::Open {
            return;
        }
        self.cancel_timers();
        self.phase = Phase::Closing;
        if let Err(e) = self.io.send(Frame::Close {
            code,
            reason: reason.to_string(),
        }) {
            log::debug!("[{}] close frame not sent: {}", self.id, e);
            self.phase = Phase::Closed;
        }
    }

    fn on_message(&mut self, text: String) {
        if self.phase != Phase::Open {
            log::debug!("[{}] dropping message received while closing", self.id);
            return;
        }
        log::info!("[{}] received: {}", self.id, text);

        if self.gating == Gating::AwaitingTrigger {
            if is_trigger(&text, &self.config.trigger_phrase) {
                self.gating = Gating::Active;
                self.send_json(&ServerMessage::AuthAck {
                    message: "Authenticated; periodic updates started".to_string(),
                });
                self.start_timer(TimerKind::PeriodicPush, self.config.push_interval_ms);
            } else {
                log::debug!(
                    "[{}] {}",
                    self.id,
                    EchoError::ProtocolViolation("message before trigger phrase".to_string())
                );
                let message = format!(
                    "Not authenticated. Send '{}' to start updates.",
                    self.config.trigger_phrase
                );
                self.send_json(&ServerMessage::Error { message });
            }
            return;
        }

        if self.protocol() == Some(self.config.query_protocol.as_str()) {
            self.send_json(&ServerMessage::GqlAck { payload: text });
            return;
        }
        match self.config.echo_style {
            EchoStyle::Raw => self.send(Frame::Text(text)),
            EchoStyle::Envelope => self.send_json(&ServerMessage::Echo { message: text }),
        }
    }

    fn on_tick(&mut self, kind: TimerKind) {
        // Ticks queued before cancellation must not send.
        if self.phase != Phase::Open || !self.io.is_open() {
            return;
        }
        match kind {
            TimerKind::LivenessProbe => self.send(Frame::Ping),
            TimerKind::PeriodicPush => {
                if self.gating != Gating::Active {
                    return;
                }
                self.pushes += 1;
                let push = ServerMessage::ServerMessage {
                    message: format!("Periodic update #{}", self.pushes),
                    timestamp: now_iso8601(),
                };
                self.send_json(&push);
            }
        }
    }

    fn start_timer(&mut self, kind: TimerKind, every_ms: u64) {
        if every_ms == 0 {
            log::debug!("[{}] {:?} disabled (interval 0)", self.id, kind);
            return;
        }
        if self.timers.iter().any(|(k, _)| *k == kind) {
            return;
        }
        let handle = self.io.start_timer(kind, Duration::from_millis(every_ms));
        self.timers.push((kind, handle));
    }

    fn cancel_timers(&mut self) {
        for (_, timer) in self.timers.drain(..) {
            timer.cancel();
        }
    }

    /// Terminal transition: timers cancelled, nothing more is sent.
    fn finish(&mut self) {
        self.cancel_timers();
        self.phase = Phase::Closed;
    }

    fn send_json(&mut self, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(text) => self.send(Frame::Text(text)),
            Err(e) => log::warn!("[{}] serializing {:?}: {}", self.id, msg, e),
        }
    }

    fn send(&mut self, frame: Frame) {
        if self.phase != Phase::Open {
            return;
        }
        if let Err(e) = self.io.send(frame) {
            log::warn!("[{}] {}", self.id, e);
            self.finish();
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> Option<&str> {
        self.negotiation.protocol()
    }

    pub fn gating(&self) -> Gating {
        self.gating
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn pong_count(&self) -> u64 {
        self.pongs
    }

    pub fn push_count(&self) -> u64 {
        self.pushes
    }

    /// Kinds of timers currently running.
    pub fn active_timers(&self) -> Vec<TimerKind> {
        self.timers.iter().map(|(k, _)| *k).collect()
    }

    pub fn io(&self) -> &IO {
        &self.io
    }
}

fn is_trigger(text: &str, phrase: &str) -> bool {
    text.trim().to_lowercase() == phrase.trim().to_lowercase()
}
