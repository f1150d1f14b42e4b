//! Self-healing Slack RTM client with a coroutine-style conversation bridge.
//!
//! The crate is organized by concern:
//! - `config`: bot options, heartbeat tolerance, and defaults.
//! - `api`: Web API client and the connection descriptor fetcher.
//! - `stream`: supervised websocket sessions and the inbound event stream.
//! - `bridge`: stream operator driving resumable procedures from events.
//! - `bot`: top-level handle wiring the pieces together.
//! - `retry`: reconnect backoff and timeout utilities.

/// Web API client and connection descriptors.
pub mod api;
/// Top-level bot handle and conversation drivers.
pub mod bot;
/// Coroutine bridge stream operator.
pub mod bridge;
/// Bot options and defaults.
pub mod config;
/// Backoff and timeout helpers used across the crate.
pub mod retry;
/// Realtime stream supervisor, protocol types, and session lifecycle.
pub mod stream;

pub use bot::{Bot, BotError};
pub use bridge::{bridge, bridge_keyed, Procedure, ReplyValue, Step, Turns};
pub use config::BotOptions;
pub use stream::proto::EventFilter;
