//! One physical websocket connection with heartbeat and liveness watchdog.
//!
//! A [`SocketSession`] is single-use: it connects, republishes inbound events
//! until the connection dies, then reports why. The supervisor builds a new
//! session for every reconnect.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::api::ConnectionDescriptor;
use crate::config::HeartbeatConfig;
use crate::retry::{with_timeout, ClassifiedError};
use crate::stream::client::StreamError;
use crate::stream::proto::{ClientFrame, RtmEvent};

/// Lifecycle of one physical connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why an open session ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// The server closed the socket or the stream ended.
    Remote,
    /// A read or write on the socket failed.
    Transport(String),
    /// No pong arrived within the heartbeat tolerance.
    Watchdog,
    /// The owner asked the session to stop.
    Cancelled,
}

impl CloseReason {
    /// Classification used for reconnect pacing.
    pub fn classify(&self) -> ClassifiedError {
        match self {
            Self::Remote => ClassifiedError::Transient("connection closed by remote".to_string()),
            Self::Transport(detail) => ClassifiedError::Transient(detail.clone()),
            Self::Watchdog => ClassifiedError::Transient("heartbeat timed out".to_string()),
            Self::Cancelled => ClassifiedError::Transient("session cancelled".to_string()),
        }
    }
}

/// Time of the most recent pong seen by a session.
#[derive(Clone, Copy, Debug)]
pub struct LivenessRecord {
    last_pong: Instant,
}

impl LivenessRecord {
    /// Starts the record as if a pong arrived at `opened_at`.
    pub fn new(opened_at: Instant) -> Self {
        Self {
            last_pong: opened_at,
        }
    }

    pub fn record_pong(&mut self, at: Instant) {
        if at > self.last_pong {
            self.last_pong = at;
        }
    }

    pub fn last_pong(&self) -> Instant {
        self.last_pong
    }

    /// True once the last pong is older than the heartbeat tolerance.
    pub fn is_stale(&self, now: Instant, heartbeat: &HeartbeatConfig) -> bool {
        now.saturating_duration_since(self.last_pong) > heartbeat.staleness_threshold()
    }
}

/// Cloneable route back to the live connection an event arrived on.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<ClientFrame>,
}

impl SessionHandle {
    /// Sequence number of the session within its supervisor.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues a frame on this connection.
    ///
    /// Fails with [`StreamError::SendQueueClosed`] once the session has
    /// ended; frames are never redirected to a later connection.
    pub fn send(&self, frame: ClientFrame) -> Result<(), StreamError> {
        self.tx
            .send(frame)
            .map_err(|_| StreamError::SendQueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn detached(id: u64) -> (Self, mpsc::UnboundedReceiver<ClientFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }
}

/// Event republished by a session, tagged with where it came from.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub event: RtmEvent,
    pub session: SessionHandle,
    pub descriptor: Arc<ConnectionDescriptor>,
}

impl InboundEvent {
    pub fn channel(&self) -> Option<&str> {
        self.event.channel()
    }
}

/// Owner of exactly one websocket connection.
#[derive(Debug)]
pub struct SocketSession {
    id: u64,
    descriptor: Arc<ConnectionDescriptor>,
    heartbeat: HeartbeatConfig,
    handshake_timeout: Duration,
    state: SessionState,
    visited: Vec<SessionState>,
}

impl SocketSession {
    pub fn new(
        id: u64,
        descriptor: ConnectionDescriptor,
        heartbeat: HeartbeatConfig,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            id,
            descriptor: Arc::new(descriptor),
            heartbeat,
            handshake_timeout,
            state: SessionState::Connecting,
            visited: vec![SessionState::Connecting],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state this session has been in, oldest first.
    pub fn visited(&self) -> &[SessionState] {
        &self.visited
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "session state must move forward");
        debug!(
            event = "session_state",
            session_id = self.id,
            from = ?self.state,
            to = ?next
        );
        self.state = next;
        self.visited.push(next);
    }

    /// Connects and runs the session until it ends.
    ///
    /// Returns `Err` only when the connection never opened. Once open, every
    /// ending is reported as a [`CloseReason`]; the socket is closed and
    /// dropped before this returns. A session runs at most once.
    pub async fn run<P>(
        &mut self,
        mut publish: P,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CloseReason, StreamError>
    where
        P: FnMut(InboundEvent),
    {
        let url = self.descriptor.url.clone();
        let connect = with_timeout(self.handshake_timeout, connect_async(url));
        let connected = tokio::select! {
            connected = connect => connected,
            _ = shutdown.changed() => {
                self.transition(SessionState::Closed);
                return Ok(CloseReason::Cancelled);
            }
        };
        let (mut socket, _) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                self.transition(SessionState::Closed);
                return Err(StreamError::WebSocket(err));
            }
            Err(_) => {
                self.transition(SessionState::Closed);
                return Err(StreamError::HandshakeTimeout(self.handshake_timeout));
            }
        };

        self.transition(SessionState::Open);
        info!(event = "session_open", session_id = self.id);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            id: self.id,
            tx: outbound_tx,
        };
        let mut liveness = LivenessRecord::new(Instant::now());
        let mut heartbeat = tokio::time::interval(self.heartbeat.interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if liveness.is_stale(Instant::now(), &self.heartbeat) {
                        warn!(
                            event = "watchdog_timeout",
                            session_id = self.id,
                            since_pong_ms = liveness.last_pong().elapsed().as_millis() as u64
                        );
                        break CloseReason::Watchdog;
                    }
                    if let Err(err) = socket.send(Message::Ping(Vec::new())).await {
                        break CloseReason::Transport(err.to_string());
                    }
                }
                maybe_outbound = outbound_rx.recv() => {
                    let Some(frame) = maybe_outbound else {
                        continue;
                    };
                    let text = match frame.to_text() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(event = "frame_encode_failed", session_id = self.id, error = %err);
                            continue;
                        }
                    };
                    if let Err(err) = socket.send(Message::Text(text)).await {
                        break CloseReason::Transport(err.to_string());
                    }
                }
                maybe_inbound = socket.next() => {
                    match maybe_inbound {
                        Some(Ok(Message::Text(text))) => match RtmEvent::from_text(&text) {
                            Ok(event) => publish(InboundEvent {
                                event,
                                session: handle.clone(),
                                descriptor: Arc::clone(&self.descriptor),
                            }),
                            Err(err) => {
                                warn!(event = "frame_dropped", session_id = self.id, error = %err);
                            }
                        },
                        // tungstenite queues the pong and flushes it on the next read.
                        Some(Ok(Message::Ping(_))) => {}
                        Some(Ok(Message::Pong(_))) => liveness.record_pong(Instant::now()),
                        Some(Ok(Message::Close(_))) | None => break CloseReason::Remote,
                        Some(Ok(_)) => {
                            debug!(event = "frame_ignored", session_id = self.id);
                        }
                        Some(Err(err)) => break CloseReason::Transport(err.to_string()),
                    }
                }
                _ = shutdown.changed() => break CloseReason::Cancelled,
            }
        };

        self.transition(SessionState::Closing);
        let _ = with_timeout(self.handshake_timeout, socket.close(None)).await;
        drop(socket);
        self.transition(SessionState::Closed);
        info!(event = "session_closed", session_id = self.id, reason = ?reason);

        Ok(reason)
    }
}
