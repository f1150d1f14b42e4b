//! Bot configuration and validation.
//!
//! Options follow the builder style used across the crate: start from
//! [`BotOptions::default`] (or [`BotOptions::from_env`]) and override with
//! `with_*` methods. Validation happens once, in [`BotOptions::validate`],
//! before any connection attempt is made.

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

/// Production Slack Web API base URL.
pub const SLACK_API_BASE_URL: &str = "https://slack.com";
/// Environment variable read by [`BotOptions::from_env`].
pub const TOKEN_ENV_VAR: &str = "SLACK_TOKEN";

/// Default values for [`BotOptions`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BotDefaults;

impl BotDefaults {
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
    pub const HEARTBEAT_RETRY_LIMIT: u32 = 2;
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CONNECT_METHOD: &'static str = "rtm.start";
}

/// Heartbeat cadence and tolerance shared by every socket session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeartbeatConfig {
    /// Time between two pings.
    pub interval: Duration,
    /// Number of missed heartbeats tolerated before the watchdog fires.
    pub retry_limit: u32,
}

impl HeartbeatConfig {
    /// Maximum allowed age of the last pong, `interval * (retry_limit - 0.5)`.
    ///
    /// Requires `retry_limit >= 1`, which [`BotOptions::validate`] enforces.
    pub fn staleness_threshold(&self) -> Duration {
        let half_steps = self.retry_limit.saturating_mul(2).saturating_sub(1);
        self.interval.saturating_mul(half_steps) / 2
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: BotDefaults::HEARTBEAT_INTERVAL,
            retry_limit: BotDefaults::HEARTBEAT_RETRY_LIMIT,
        }
    }
}

/// Recognized bot options.
#[derive(Clone, Debug)]
pub struct BotOptions {
    /// Bot token. Required.
    pub token: Option<SecretString>,
    pub heartbeat: HeartbeatConfig,
    /// Per-request timeout for Web API calls and the websocket handshake.
    pub request_timeout: Duration,
    /// TCP connect timeout for Web API calls.
    pub connect_timeout: Duration,
    /// Web API base URL, without the `/api` suffix.
    pub api_base_url: String,
    /// Web API method returning the websocket URL.
    pub connect_method: String,
}

impl Default for BotOptions {
    fn default() -> Self {
        Self {
            token: None,
            heartbeat: HeartbeatConfig::default(),
            request_timeout: BotDefaults::REQUEST_TIMEOUT,
            connect_timeout: BotDefaults::CONNECT_TIMEOUT,
            api_base_url: SLACK_API_BASE_URL.to_string(),
            connect_method: BotDefaults::CONNECT_METHOD.to_string(),
        }
    }
}

impl BotOptions {
    /// Default options with the given token.
    pub fn new(token: SecretString) -> Self {
        Self::default().with_token(token)
    }

    /// Default options with the token taken from `SLACK_TOKEN`, if set.
    ///
    /// A missing variable is not an error here; it surfaces as
    /// [`ConfigError::MissingToken`] when the bot is built.
    pub fn from_env() -> Self {
        let token = std::env::var(TOKEN_ENV_VAR)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(SecretString::new);
        Self {
            token,
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, retry_limit: u32) -> Self {
        self.heartbeat = HeartbeatConfig {
            interval,
            retry_limit,
        };
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the Web API base URL. Trailing slashes are trimmed.
    pub fn with_api_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.api_base_url = base_url.trim_end().trim_end_matches('/').to_string();
        self
    }

    /// Selects the Web API method used to obtain the websocket URL.
    pub fn with_connect_method(mut self, method: impl Into<String>) -> Self {
        self.connect_method = method.into();
        self
    }

    /// Checks the options and returns the token on success.
    pub fn validate(&self) -> Result<&SecretString, ConfigError> {
        let token = self.token.as_ref().ok_or(ConfigError::MissingToken)?;
        if self.heartbeat.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be > 0".to_string(),
            ));
        }
        if self.heartbeat.retry_limit == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat retry limit must be >= 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request timeout must be > 0".to_string(),
            ));
        }
        if self.connect_method.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "connect method must not be empty".to_string(),
            ));
        }
        Ok(token)
    }
}

/// Fatal configuration problems reported at construction time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No bot token was supplied.
    #[error("missing bot token")]
    MissingToken,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
