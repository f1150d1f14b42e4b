//! Session supervisor: the never-ending RTM event stream.
//!
//! The supervisor runs a background worker that loops forever: fetch a
//! connection descriptor, run one [`SocketSession`] to completion, wait per
//! [`BackoffPolicy`], repeat. The worker is spawned by the first
//! [`Supervisor::subscribe`], so the first subscriber sees the first `hello`.
//! Consumers only ever see gaps while a reconnect is in progress.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info};

use crate::api::DescriptorSource;
use crate::config::{BotOptions, HeartbeatConfig};
use crate::retry::{BackoffPolicy, ClassifiedError};
use crate::stream::session::{CloseReason, InboundEvent, SocketSession};

/// Reconnect and heartbeat settings shared by every session.
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub heartbeat: HeartbeatConfig,
    /// Upper bound for the websocket handshake and the closing handshake.
    pub handshake_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl From<&BotOptions> for SupervisorSettings {
    fn from(options: &BotOptions) -> Self {
        Self {
            heartbeat: options.heartbeat,
            handshake_timeout: options.request_timeout,
            backoff: BackoffPolicy::default(),
        }
    }
}

enum Worker {
    Idle(BoxFuture<'static, ()>),
    Running(JoinHandle<()>),
    Stopped,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle(_) => "Idle",
            Self::Running(_) => "Running",
            Self::Stopped => "Stopped",
        })
    }
}

/// Handle to the background reconnect loop.
///
/// Nothing connects until the first [`Supervisor::subscribe`]. The loop stops
/// when [`Supervisor::shutdown`] is called, or once this handle and every
/// [`EventStream`] obtained from it have been dropped.
#[derive(Debug)]
pub struct Supervisor {
    subscribers: Arc<Subscribers>,
    lifeline: Arc<watch::Sender<bool>>,
    worker: Mutex<Worker>,
}

impl Supervisor {
    /// Prepares the reconnect loop without connecting.
    pub fn new<F>(source: F, settings: SupervisorSettings) -> Self
    where
        F: DescriptorSource,
    {
        let subscribers = Arc::new(Subscribers::default());
        let (lifeline, shutdown_rx) = watch::channel(false);
        let loop_future = supervise(source, settings, Arc::clone(&subscribers), shutdown_rx).boxed();

        Self {
            subscribers,
            lifeline: Arc::new(lifeline),
            worker: Mutex::new(Worker::Idle(loop_future)),
        }
    }

    /// Whether the reconnect loop has been spawned.
    pub fn is_started(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| !matches!(*worker, Worker::Idle(_)))
            .unwrap_or(false)
    }

    /// Subscribes to every event published from now on.
    ///
    /// The first call spawns the reconnect loop on the current tokio runtime,
    /// after the subscriber is registered.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.add(tx);
        let stream = EventStream {
            rx,
            _lifeline: Arc::clone(&self.lifeline),
        };
        self.start();
        stream
    }

    fn start(&self) {
        let Ok(mut worker) = self.worker.lock() else {
            return;
        };
        match std::mem::replace(&mut *worker, Worker::Stopped) {
            Worker::Idle(loop_future) => {
                debug!(event = "supervisor_started");
                *worker = Worker::Running(tokio::spawn(loop_future));
            }
            other => *worker = other,
        }
    }

    /// Stops the loop, closing the live session, and waits for the worker.
    ///
    /// Open subscriber streams end once the worker has exited.
    pub async fn shutdown(self) {
        let _ = self.lifeline.send(true);
        let worker = match self.worker.into_inner() {
            Ok(worker) => worker,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Worker::Running(handle) = worker {
            let _ = handle.await;
        }
        self.subscribers.close();
    }
}

/// Never-ending stream of inbound events from successive sessions.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<InboundEvent>,
    _lifeline: Arc<watch::Sender<bool>>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = InboundEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Default)]
struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<InboundEvent>>>,
}

impl Subscribers {
    fn add(&self, tx: mpsc::UnboundedSender<InboundEvent>) {
        if let Ok(mut guard) = self.senders.lock() {
            guard.push(tx);
        }
    }

    fn publish(&self, event: InboundEvent) {
        if let Ok(mut guard) = self.senders.lock() {
            guard.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn close(&self) {
        if let Ok(mut guard) = self.senders.lock() {
            guard.clear();
        }
    }
}

async fn supervise<F>(
    source: F,
    settings: SupervisorSettings,
    subscribers: Arc<Subscribers>,
    mut shutdown: watch::Receiver<bool>,
) where
    F: DescriptorSource,
{
    let mut attempt: u32 = 0;
    let mut session_seq: u64 = 0;

    'reconnect: loop {
        if *shutdown.borrow() {
            break;
        }

        let fetched = tokio::select! {
            fetched = source.fetch() => fetched,
            _ = shutdown.changed() => break 'reconnect,
        };

        let failure = match fetched {
            Err(err) => err,
            Ok(descriptor) => {
                session_seq += 1;
                debug!(event = "descriptor_fetched", session_id = session_seq, url = %descriptor.url);
                let mut session = SocketSession::new(
                    session_seq,
                    descriptor,
                    settings.heartbeat,
                    settings.handshake_timeout,
                );
                match session
                    .run(|event| subscribers.publish(event), &mut shutdown)
                    .await
                {
                    Ok(CloseReason::Cancelled) => break 'reconnect,
                    Ok(reason) => {
                        attempt = 0;
                        reason.classify()
                    }
                    Err(err) => err.classify(),
                }
            }
        };

        attempt = attempt.saturating_add(1);
        let delay = settings.backoff.delay(&failure, attempt);
        info!(
            event = "reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break 'reconnect,
        }
    }

    subscribers.close();
    debug!(event = "supervisor_stopped", sessions = session_seq);
}

/// Errors produced by the websocket transport.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("websocket handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The session this handle belongs to has ended.
    #[error("send queue is closed")]
    SendQueueClosed,
}

impl StreamError {
    /// Maps the error onto the reconnect taxonomy.
    pub fn classify(&self) -> ClassifiedError {
        match self {
            Self::WebSocket(WsError::Http(response))
                if response.status() == StatusCode::TOO_MANY_REQUESTS =>
            {
                let delay = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map(|secs| Duration::from_millis(secs.saturating_mul(1000)))
                    .unwrap_or(Duration::ZERO);
                ClassifiedError::RateLimited { delay }
            }
            other => ClassifiedError::Transient(other.to_string()),
        }
    }
}
