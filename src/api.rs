//! Slack Web API client and the connection descriptor fetcher.
//!
//! [`ApiClient::call_api`] performs one request and maps the outcome onto
//! [`ApiError`]. It never retries: [`RtmConnectFetcher`] classifies its
//! failures and leaves pacing to the supervisor.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::BotOptions;
use crate::retry::ClassifiedError;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const INVALID_AUTH: &str = "invalid_auth";

/// Endpoint returned by the connect call.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionDescriptor {
    /// Websocket URL to open.
    pub url: String,
    /// Full response body, kept opaque.
    pub attributes: Value,
}

/// Source of connection descriptors used by the supervisor.
pub trait DescriptorSource: Send + Sync + 'static {
    /// Performs one fetch. Implementations must not retry internally.
    fn fetch(&self) -> impl Future<Output = Result<ConnectionDescriptor, ClassifiedError>> + Send;
}

/// Thin Slack Web API client.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    token: SecretString,
    base_url: String,
    request_timeout: Duration,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(token: SecretString, options: &BotOptions) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            token,
            base_url: options.api_base_url.clone(),
            request_timeout: options.request_timeout,
        })
    }

    /// Calls a Web API method and returns the JSON body of a successful reply.
    ///
    /// The bot token is added as the `token` query parameter unless `params`
    /// already carries one.
    pub async fn call_api(&self, method: &str, params: &[(&str, &str)]) -> Result<Value, ApiError> {
        let endpoint = self.endpoint(method);
        let mut builder = self.http.get(&endpoint).timeout(self.request_timeout);
        if !params.iter().any(|(key, _)| *key == "token") {
            builder = builder.query(&[("token", self.token.expose_secret().as_str())]);
        }
        if !params.is_empty() {
            builder = builder.query(params);
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_delay(response.headers());
            debug!(event = "api_rate_limited", method, retry_after_ms = retry_after.as_millis() as u64);
            return Err(ApiError::RateLimited { retry_after });
        }

        let body = response.text().await.map_err(ApiError::Transport)?;
        if status != StatusCode::OK {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_api_response(&body)
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/api/{}", self.base_url, method)
    }
}

/// Fetches the websocket URL through `rtm.start` (or `rtm.connect`).
#[derive(Clone, Debug)]
pub struct RtmConnectFetcher {
    api: ApiClient,
    method: String,
}

impl RtmConnectFetcher {
    pub fn new(api: ApiClient, method: impl Into<String>) -> Self {
        Self {
            api,
            method: method.into(),
        }
    }

    async fn fetch_once(&self) -> Result<ConnectionDescriptor, ClassifiedError> {
        let body = self
            .api
            .call_api(
                &self.method,
                &[("simple_latest", "true"), ("no_unreads", "true")],
            )
            .await
            .map_err(|err| err.classify())?;
        descriptor_from_body(body)
    }
}

impl DescriptorSource for RtmConnectFetcher {
    fn fetch(&self) -> impl Future<Output = Result<ConnectionDescriptor, ClassifiedError>> + Send {
        self.fetch_once()
    }
}

/// Errors from a single Web API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// The body carried `ok: false`.
    #[error("api error: {error}")]
    Api { error: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    /// Maps the error onto the reconnect taxonomy.
    pub fn classify(&self) -> ClassifiedError {
        match self {
            Self::RateLimited { retry_after } => ClassifiedError::RateLimited {
                delay: *retry_after,
            },
            Self::Api { error } if error == INVALID_AUTH => ClassifiedError::AuthRejected,
            other => ClassifiedError::Transient(other.to_string()),
        }
    }
}

fn descriptor_from_body(body: Value) -> Result<ConnectionDescriptor, ClassifiedError> {
    let url = body
        .get("url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClassifiedError::Transient("connect response missing url".to_string()))?;
    Ok(ConnectionDescriptor {
        url,
        attributes: body,
    })
}

fn parse_api_response(body: &str) -> Result<Value, ApiError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| ApiError::Parse(err.to_string()))?;
    if value.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(value);
    }

    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error")
        .to_string();
    Err(ApiError::Api { error })
}

fn retry_after_delay(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_millis(secs.saturating_mul(1000)))
        .unwrap_or(Duration::ZERO)
}

fn summarize_error_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
