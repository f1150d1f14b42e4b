//! Top-level bot: the supervised event stream plus conversation drivers.
//!
//! [`Bot`] composes a [`Supervisor`] and an [`ApiClient`] and exposes a
//! narrow surface: subscribe to events, hear filtered events, run
//! conversations through the coroutine bridge, and send messages.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{future, Stream, StreamExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError, DescriptorSource, RtmConnectFetcher};
use crate::bridge::{bridge, bridge_keyed, BridgeItem, Procedure, Reply};
use crate::config::{BotOptions, ConfigError};
use crate::stream::client::{EventStream, StreamError, Supervisor, SupervisorSettings};
use crate::stream::proto::{ClientFrame, EventFilter};
use crate::stream::session::{InboundEvent, SessionHandle};

/// Outbound message id sequence for one bot instance. The first id is 1.
#[derive(Debug, Default)]
pub struct MessageIds {
    last: AtomicU64,
}

impl MessageIds {
    pub fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Errors returned while building a [`Bot`].
#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build api client: {0}")]
    Api(#[from] ApiError),
}

/// RTM bot handle.
#[derive(Debug)]
pub struct Bot {
    supervisor: Supervisor,
    api: ApiClient,
    ids: Arc<MessageIds>,
}

impl Bot {
    /// Validates `options` and prepares the reconnect loop.
    ///
    /// Fails without touching the network when the options are invalid.
    /// Connecting starts with the first [`Bot::subscribe`], [`Bot::hear`] or
    /// [`Bot::converse`], which must run inside a tokio runtime.
    pub fn new(options: BotOptions) -> Result<Self, BotError> {
        let token = options.validate()?.clone();
        let api = ApiClient::new(token, &options)?;
        let fetcher = RtmConnectFetcher::new(api.clone(), options.connect_method.clone());
        Ok(Self::assemble(&options, api, fetcher))
    }

    /// Like [`Bot::new`] with a custom descriptor source.
    pub fn with_source<F>(options: BotOptions, source: F) -> Result<Self, BotError>
    where
        F: DescriptorSource,
    {
        let token = options.validate()?.clone();
        let api = ApiClient::new(token, &options)?;
        Ok(Self::assemble(&options, api, source))
    }

    fn assemble<F>(options: &BotOptions, api: ApiClient, source: F) -> Self
    where
        F: DescriptorSource,
    {
        Self {
            supervisor: Supervisor::new(source, SupervisorSettings::from(options)),
            api,
            ids: Arc::new(MessageIds::default()),
        }
    }

    /// Web API client sharing the bot token.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Every inbound event, across reconnects. Starts connecting on first use.
    pub fn subscribe(&self) -> EventStream {
        self.supervisor.subscribe()
    }

    /// Inbound events accepted by `filter`.
    pub fn hear(&self, filter: EventFilter) -> impl Stream<Item = InboundEvent> + Send + Unpin {
        self.subscribe()
            .filter(move |inbound| future::ready(filter.matches(&inbound.event)))
    }

    pub fn next_id(&self) -> u64 {
        self.ids.next_id()
    }

    /// Sends `text` to `channel` on the given session and returns the frame id.
    pub fn send(
        &self,
        session: &SessionHandle,
        channel: &str,
        text: &str,
    ) -> Result<u64, StreamError> {
        let id = self.next_id();
        session.send(ClientFrame::message(id, channel, text))?;
        Ok(id)
    }

    /// Runs one conversation over the events accepted by `filter`.
    ///
    /// `make` creates the procedure on the first matching event; replies go
    /// back to the channel and connection of the event that produced them.
    /// The returned task ends after [`Bot::shutdown`].
    pub fn converse<P, M>(&self, filter: EventFilter, make: M, concurrency: usize) -> JoinHandle<()>
    where
        P: Procedure<InboundEvent> + 'static,
        M: FnMut(&InboundEvent) -> P + Send + 'static,
    {
        let replies = bridge(self.hear(filter), make, concurrency);
        tokio::spawn(deliver_replies(replies, Arc::clone(&self.ids)))
    }

    /// Runs a separate conversation per key, e.g. per channel.
    pub fn converse_keyed<K, P, KF, M>(
        &self,
        filter: EventFilter,
        key_of: KF,
        make: M,
        concurrency: usize,
    ) -> JoinHandle<()>
    where
        K: Eq + Hash + Clone + Send + 'static,
        P: Procedure<InboundEvent> + 'static,
        KF: Fn(&InboundEvent) -> K + Send + 'static,
        M: FnMut(&InboundEvent) -> P + Send + 'static,
    {
        let replies = bridge_keyed(self.hear(filter), key_of, make, concurrency);
        tokio::spawn(deliver_replies(replies, Arc::clone(&self.ids)))
    }

    /// Stops reconnecting and closes the live session.
    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
    }
}

async fn deliver_replies<S>(mut replies: S, ids: Arc<MessageIds>)
where
    S: Stream<Item = BridgeItem<InboundEvent>> + Unpin,
{
    while let Some(item) = replies.next().await {
        match item {
            Ok(reply) => {
                if let Err(err) = deliver(&ids, &reply) {
                    debug!(
                        event = "reply_dropped",
                        session_id = reply.event.session.id(),
                        error = %err
                    );
                }
            }
            Err(failure) => warn!(
                event = "interaction_failed",
                channel = failure.event.channel().unwrap_or_default(),
                error = %failure.error
            ),
        }
    }
}

/// Sends one reply as an outbound message frame.
///
/// Empty replies and replies to events without a channel are skipped and
/// consume no id.
fn deliver(ids: &MessageIds, reply: &Reply<InboundEvent>) -> Result<Option<u64>, StreamError> {
    if reply.text.is_empty() {
        return Ok(None);
    }
    let Some(channel) = reply.event.channel() else {
        return Ok(None);
    };
    let id = ids.next_id();
    reply
        .event
        .session
        .send(ClientFrame::message(id, channel, reply.text.as_str()))?;
    Ok(Some(id))
}
