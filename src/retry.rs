//! Reconnect backoff and timeout utilities.
//!
//! Failures from the descriptor fetch and from socket sessions are folded into
//! [`ClassifiedError`]. [`BackoffPolicy`] turns a classified error plus the
//! current attempt index into a wait duration. The policy never gives up; the
//! caller owns the attempt counter and resets it after a successful open.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Failure classes that drive reconnect pacing.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClassifiedError {
    /// The server asked us to slow down for `delay`.
    #[error("rate limited, retry after {delay:?}")]
    RateLimited { delay: Duration },

    /// The credential was refused.
    #[error("authentication rejected")]
    AuthRejected,

    /// Network, transport or any other recoverable failure.
    #[error("transient failure: {0}")]
    Transient(String),
}

/// Error-classified reconnect delays.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Delay step added per consecutive transient failure.
    pub transient_step: Duration,
    /// Cooldown applied after the credential was rejected.
    pub auth_cooldown: Duration,
}

impl BackoffPolicy {
    pub const TRANSIENT_STEP: Duration = Duration::from_millis(1000);
    pub const AUTH_COOLDOWN: Duration = Duration::from_secs(60 * 60);

    /// Computes the wait before the next attempt.
    ///
    /// `attempt` is the number of consecutive failures so far, including the
    /// one being handled. Transient delays grow linearly and are not capped.
    pub fn delay(&self, error: &ClassifiedError, attempt: u32) -> Duration {
        match error {
            ClassifiedError::RateLimited { delay } => *delay,
            ClassifiedError::AuthRejected => self.auth_cooldown,
            ClassifiedError::Transient(_) => self.transient_step.saturating_mul(attempt),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            transient_step: Self::TRANSIENT_STEP,
            auth_cooldown: Self::AUTH_COOLDOWN,
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
