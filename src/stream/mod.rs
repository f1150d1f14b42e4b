//! Realtime stream modules.
//!
//! - `client`: the supervisor loop, subscriber fan-out, and transport errors.
//! - `proto`: inbound events, outbound frames, and event filters.
//! - `session`: one websocket connection with heartbeat and watchdog.

/// Reconnecting supervisor and event stream.
pub mod client;
/// RTM wire messages.
pub mod proto;
/// Single-connection session lifecycle.
pub mod session;
