//! Socket plumbing for a session: outbound channel + writer task, reader task feeding
//! [`SessionEvent`]s, and tokio-interval timers.

use crate::error::EchoError;
use crate::session::{Frame, SessionEvent, SessionIo, TimerHandle, TimerKind};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Repeating timer backed by a spawned task; cancelling aborts it (idempotent).
pub struct TaskTimer {
    handle: JoinHandle<()>,
}

impl TimerHandle for TaskTimer {
    fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for TaskTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// [`SessionIo`] over channels: frames go to the writer task, timer ticks come back as events.
pub struct ChannelIo {
    outbound: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelIo {
    pub fn new(
        outbound: mpsc::UnboundedSender<Message>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self { outbound, events }
    }
}

impl SessionIo for ChannelIo {
    type Timer = TaskTimer;

    fn send(&mut self, frame: Frame) -> Result<(), EchoError> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping => Message::Ping(Vec::new()),
            Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                // Close reasons are limited to 123 bytes.
                reason: truncate_reason(&reason).into(),
            })),
        };
        self.outbound
            .send(msg)
            .map_err(|_| EchoError::transport("socket writer has stopped"))
    }

    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn start_timer(&mut self, kind: TimerKind, every: Duration) -> TaskTimer {
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if events.send(SessionEvent::Tick(kind)).is_err() {
                    break;
                }
            }
        });
        TaskTimer { handle }
    }
}

fn truncate_reason(reason: &str) -> String {
    let mut out = String::new();
    for c in reason.chars() {
        if out.len() + c.len_utf8() > 123 {
            break;
        }
        out.push(c);
    }
    out
}

/// Forward queued frames to the socket until the queue closes or a write fails.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    conn_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if let Err(e) = sink.send(msg).await {
                log::debug!("[{}] socket write failed: {}", conn_id, e);
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Translate socket frames into session events. Keeps reading after a close frame so the
/// transport can flush its close reply; the stream then ends.
pub fn spawn_reader(
    mut stream: SplitStream<WebSocket>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut close_seen = false;
        while let Some(msg) = stream.next().await {
            let event = match msg {
                Ok(Message::Text(text)) => SessionEvent::Text(text),
                Ok(Message::Binary(bytes)) => SessionEvent::Binary(bytes),
                Ok(Message::Pong(_)) => SessionEvent::Pong,
                // Pings are answered by the transport.
                Ok(Message::Ping(_)) => continue,
                Ok(Message::Close(frame)) => {
                    close_seen = true;
                    let (code, reason) = frame
                        .map(|f| (Some(f.code), f.reason.into_owned()))
                        .unwrap_or((None, String::new()));
                    SessionEvent::PeerClosed { code, reason }
                }
                Err(e) => {
                    if !close_seen {
                        let _ = events.send(SessionEvent::TransportError(e.to_string()));
                    }
                    return;
                }
            };
            if events.send(event).is_err() {
                return;
            }
        }
        if !close_seen {
            let _ = events.send(SessionEvent::PeerClosed {
                code: None,
                reason: String::new(),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let out = truncate_reason(&long);
        assert!(out.len() <= 123);
        assert_eq!(out.chars().count(), 61);
        assert_eq!(truncate_reason("short"), "short");
    }

    #[tokio::test]
    async fn channel_io_maps_frames_and_reports_open() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let mut io = ChannelIo::new(out_tx, ev_tx);

        io.send(Frame::Text("hi".into())).unwrap();
        io.send(Frame::Close {
            code: 1001,
            reason: "bye".into(),
        })
        .unwrap();
        assert!(matches!(out_rx.recv().await, Some(Message::Text(t)) if t == "hi"));
        match out_rx.recv().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 1001);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
        assert!(io.is_open());

        drop(out_rx);
        assert!(!io.is_open());
        assert!(io.send(Frame::Ping).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn task_timer_ticks_until_cancelled() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let mut io = ChannelIo::new(out_tx, ev_tx);

        let timer = io.start_timer(TimerKind::PeriodicPush, Duration::from_millis(100));
        assert_eq!(
            ev_rx.recv().await,
            Some(SessionEvent::Tick(TimerKind::PeriodicPush))
        );
        timer.cancel();
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        while let Ok(ev) = ev_rx.try_recv() {
            // At most one tick may have been queued before the abort landed.
            assert_eq!(ev, SessionEvent::Tick(TimerKind::PeriodicPush));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(ev_rx.try_recv().is_err());
    }
}
