//! Coroutine bridge: drive suspend/resume procedures from a push stream.
//!
//! A multi-turn interaction is written as a [`Procedure`], an explicit
//! continuation that is resumed once per admitted input and answers each
//! resumption with a [`Step`]. [`Bridge`] feeds it from an event stream:
//!
//! - at most `concurrency` steps have replies in flight at any time;
//! - inputs arriving while every slot is busy wait in a FIFO buffer;
//! - every element of a step's reply stream is emitted paired with the input
//!   that produced it;
//! - a procedure that fails is dropped on its own, the bridge keeps going.
//!
//! With `concurrency == 1` a conversation is strictly sequential: the next
//! input is not even handed to the procedure until every reply of the
//! previous step has been emitted.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future;
use futures_util::stream::{self, BoxStream, SelectAll};
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tracing::debug;

/// What a step hands back to the bridge.
pub enum ReplyValue {
    /// A single reply.
    Text(String),
    /// Zero or more replies produced over time.
    Stream(BoxStream<'static, String>),
    /// No reply for this step.
    Empty,
}

impl ReplyValue {
    pub fn stream<S>(replies: S) -> Self
    where
        S: Stream<Item = String> + Send + 'static,
    {
        Self::Stream(replies.boxed())
    }

    fn into_stream(self) -> BoxStream<'static, String> {
        match self {
            Self::Text(text) => stream::once(future::ready(text)).boxed(),
            Self::Stream(replies) => replies,
            Self::Empty => stream::empty().boxed(),
        }
    }
}

impl fmt::Debug for ReplyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

impl From<String> for ReplyValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for ReplyValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<()> for ReplyValue {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

impl<T: Into<ReplyValue>> From<Option<T>> for ReplyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Empty, Into::into)
    }
}

macro_rules! numeric_reply {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ReplyValue {
            fn from(value: $ty) -> Self {
                Self::Text(value.to_string())
            }
        })*
    };
}

numeric_reply!(i32, i64, u32, u64, usize, f64);

/// Outcome of one resumption.
#[derive(Debug)]
pub struct Step {
    pub reply: ReplyValue,
    /// The procedure has finished; its unit is destroyed after this step.
    pub done: bool,
}

impl Step {
    /// Replies and stays suspended, waiting for the next input.
    pub fn reply(reply: impl Into<ReplyValue>) -> Self {
        Self {
            reply: reply.into(),
            done: false,
        }
    }

    /// Replies one last time and finishes.
    pub fn finish(reply: impl Into<ReplyValue>) -> Self {
        Self {
            reply: reply.into(),
            done: true,
        }
    }

    /// Finishes without replying.
    pub fn done() -> Self {
        Self::finish(ReplyValue::Empty)
    }
}

/// Error raised from inside a procedure step.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("interaction failed: {message}")]
pub struct InteractionError {
    message: String,
}

impl InteractionError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A resumable interaction.
///
/// The first call to `resume` receives the input that created the unit;
/// every later call receives the next admitted input for the same unit.
pub trait Procedure<E>: Send {
    fn resume(&mut self, input: &E) -> Result<Step, InteractionError>;
}

impl<E, F> Procedure<E> for F
where
    F: FnMut(&E) -> Result<Step, InteractionError> + Send,
{
    fn resume(&mut self, input: &E) -> Result<Step, InteractionError> {
        self(input)
    }
}

/// Pins a closure to the [`Procedure`] signature so its argument and error
/// types are inferred.
pub fn procedure_fn<E, F>(step: F) -> F
where
    F: FnMut(&E) -> Result<Step, InteractionError> + Send,
{
    step
}

type Turn<E> = Box<dyn FnMut(&E) -> Result<ReplyValue, InteractionError> + Send>;

/// Procedure built from an ordered list of turns, one per input.
///
/// Finishes after the last turn; an empty `Turns` finishes on its first
/// resumption without replying.
pub struct Turns<E> {
    turns: VecDeque<Turn<E>>,
}

impl<E: 'static> Turns<E> {
    pub fn new() -> Self {
        Self {
            turns: VecDeque::new(),
        }
    }

    /// Appends a turn that always succeeds.
    pub fn then<F, R>(self, mut turn: F) -> Self
    where
        F: FnMut(&E) -> R + Send + 'static,
        R: Into<ReplyValue>,
    {
        self.try_then(move |input| Ok(turn(input)))
    }

    /// Appends a turn that may fail.
    pub fn try_then<F, R>(mut self, mut turn: F) -> Self
    where
        F: FnMut(&E) -> Result<R, InteractionError> + Send + 'static,
        R: Into<ReplyValue>,
    {
        self.turns.push_back(Box::new(
            move |input: &E| -> Result<ReplyValue, InteractionError> {
                turn(input).map(Into::into)
            },
        ));
        self
    }
}

impl<E: 'static> Default for Turns<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Procedure<E> for Turns<E> {
    fn resume(&mut self, input: &E) -> Result<Step, InteractionError> {
        let Some(mut turn) = self.turns.pop_front() else {
            return Ok(Step::done());
        };
        let reply = turn(input)?;
        Ok(Step {
            reply,
            done: self.turns.is_empty(),
        })
    }
}

/// One reply produced by the bridge.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply<E> {
    /// Input whose step produced this reply.
    pub event: E,
    pub text: String,
}

/// A unit that failed, with the input that triggered the failure.
#[derive(Clone, Debug, PartialEq)]
pub struct Failure<E> {
    pub event: E,
    pub error: InteractionError,
}

pub type BridgeItem<E> = Result<Reply<E>, Failure<E>>;

enum InFlight<E> {
    Reply(Reply<E>),
    Finished,
}

/// Stream operator driving procedures from `source`. See the module docs.
pub struct Bridge<S, E, K, P> {
    source: S,
    source_done: bool,
    key_of: Box<dyn Fn(&E) -> K + Send>,
    make: Box<dyn FnMut(&E) -> P + Send>,
    concurrency: usize,
    active: usize,
    buffer: VecDeque<E>,
    units: HashMap<K, P>,
    in_flight: SelectAll<BoxStream<'static, InFlight<E>>>,
    failures: VecDeque<Failure<E>>,
}

/// Bridges `source` through a single procedure instance.
///
/// The unit is created by `make` on the first admitted input and recreated
/// on the next input after it finishes or fails. `concurrency` below 1 is
/// treated as 1.
pub fn bridge<S, E, P, M>(source: S, make: M, concurrency: usize) -> Bridge<S, E, (), P>
where
    S: Stream<Item = E> + Unpin,
    E: Clone + Send + 'static,
    P: Procedure<E>,
    M: FnMut(&E) -> P + Send + 'static,
{
    Bridge::new(source, |_| (), make, concurrency)
}

/// Like [`bridge`], with one procedure instance per key.
pub fn bridge_keyed<S, E, K, P, KF, M>(
    source: S,
    key_of: KF,
    make: M,
    concurrency: usize,
) -> Bridge<S, E, K, P>
where
    S: Stream<Item = E> + Unpin,
    E: Clone + Send + 'static,
    K: Eq + Hash + Clone,
    P: Procedure<E>,
    KF: Fn(&E) -> K + Send + 'static,
    M: FnMut(&E) -> P + Send + 'static,
{
    Bridge::new(source, key_of, make, concurrency)
}

impl<S, E, K, P> Bridge<S, E, K, P>
where
    S: Stream<Item = E> + Unpin,
    E: Clone + Send + 'static,
    K: Eq + Hash + Clone,
    P: Procedure<E>,
{
    fn new<KF, M>(source: S, key_of: KF, make: M, concurrency: usize) -> Self
    where
        KF: Fn(&E) -> K + Send + 'static,
        M: FnMut(&E) -> P + Send + 'static,
    {
        Self {
            source,
            source_done: false,
            key_of: Box::new(key_of),
            make: Box::new(make),
            concurrency: concurrency.max(1),
            active: 0,
            buffer: VecDeque::new(),
            units: HashMap::new(),
            in_flight: SelectAll::new(),
            failures: VecDeque::new(),
        }
    }

    /// Steps whose replies are still being emitted.
    pub fn active(&self) -> usize {
        self.active
    }

    /// Inputs waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.buffer.len()
    }

    /// Procedures currently suspended between inputs.
    pub fn live_units(&self) -> usize {
        self.units.len()
    }

    fn admit(&mut self, event: E) {
        let key = (self.key_of)(&event);
        let unit = match self.units.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert((self.make)(&event)),
        };
        let outcome = unit.resume(&event);

        match outcome {
            Ok(step) => {
                if step.done {
                    self.units.remove(&key);
                }
                self.active += 1;
                let source = event;
                let replies = step.reply.into_stream().map(move |text| {
                    InFlight::Reply(Reply {
                        event: source.clone(),
                        text,
                    })
                });
                self.in_flight.push(
                    replies
                        .chain(stream::once(future::ready(InFlight::Finished)))
                        .boxed(),
                );
            }
            Err(error) => {
                self.units.remove(&key);
                debug!(event = "unit_dropped", error = %error);
                self.failures.push_back(Failure { event, error });
            }
        }
    }

    fn fill_free_slots(&mut self) {
        while self.active < self.concurrency {
            let Some(next) = self.buffer.pop_front() else {
                break;
            };
            self.admit(next);
        }
    }

    fn is_drained(&self) -> bool {
        self.source_done && self.active == 0 && self.buffer.is_empty() && self.failures.is_empty()
    }
}

impl<S, E, K, P> Unpin for Bridge<S, E, K, P> where S: Unpin {}

impl<S, E, K, P> Stream for Bridge<S, E, K, P>
where
    S: Stream<Item = E> + Unpin,
    E: Clone + Send + 'static,
    K: Eq + Hash + Clone,
    P: Procedure<E>,
{
    type Item = BridgeItem<E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(failure) = this.failures.pop_front() {
                return Poll::Ready(Some(Err(failure)));
            }

            if let Poll::Ready(Some(item)) = this.in_flight.poll_next_unpin(cx) {
                match item {
                    InFlight::Reply(reply) => return Poll::Ready(Some(Ok(reply))),
                    InFlight::Finished => {
                        this.active -= 1;
                        this.fill_free_slots();
                        continue;
                    }
                }
            }

            if !this.source_done {
                match this.source.poll_next_unpin(cx) {
                    Poll::Ready(Some(event)) => {
                        if this.active < this.concurrency {
                            this.admit(event);
                        } else {
                            this.buffer.push_back(event);
                        }
                        continue;
                    }
                    Poll::Ready(None) => {
                        this.source_done = true;
                        continue;
                    }
                    Poll::Pending => {}
                }
            }

            if this.is_drained() {
                return Poll::Ready(None);
            }
            return Poll::Pending;
        }
    }
}
