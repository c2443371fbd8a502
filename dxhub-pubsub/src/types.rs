//! Public types for the dxhub-pubsub crate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// A boxed error type for credential providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Returns the current credential bytes.
///
/// Invoked once per authenticated request, so the caller may rotate the
/// credential at any time.
pub type CredentialProvider = Arc<dyn Fn() -> Result<Vec<u8>, BoxError> + Send + Sync>;

/// Message headers, as carried on publish and consume.
pub type Headers = HashMap<String, String>;

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_CONSUME_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

pub(crate) const MISSING_GROUP_ID: &str = "Config must contain GroupID";
pub(crate) const MISSING_DOMAIN: &str = "Config must contain Domain";
pub(crate) const MISSING_PROVIDER: &str =
    "Config must contain either APIKeyProvider or AuthTokenProvider";

/// What a stream poller does after a consume request goes unanswered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumeTimeoutPolicy {
    /// Report the first timeout of a streak and keep polling.
    #[default]
    KeepPolling,
    /// Stop the poller after this many consecutive timeouts.
    StopAfter(u32),
}

/// Configuration for a [`Connection`](crate::Connection).
pub struct Config {
    /// Consumer group the subscriptions are created under.
    pub group_id: String,
    /// Broker host, e.g. `"dxhub.example.com"`.
    pub domain: String,
    /// Sends credentials as `X-Api-Key`. Takes precedence over
    /// `auth_token_provider` when both are set.
    pub api_key_provider: Option<CredentialProvider>,
    /// Sends credentials as `X-Auth-Token`.
    pub auth_token_provider: Option<CredentialProvider>,
    /// Delay between consume attempts of one stream.
    pub poll_interval: Duration,
    /// Bound on waiting for a single consume response.
    pub consume_response_timeout: Duration,
    /// What a poller does after consume requests go unanswered.
    pub consume_timeout_policy: ConsumeTimeoutPolicy,
    /// Capacity of each subscription's event channel and of the connection
    /// event channel.
    pub event_channel_capacity: usize,
    /// REST host override. Defaults to `domain`.
    pub rest_host: Option<String>,
    /// Pub/sub WebSocket host override. Defaults to `domain`.
    pub pubsub_host: Option<String>,
    /// `https`/`wss` when true, `http`/`ws` otherwise.
    pub use_tls: bool,
    /// Timeout for REST calls and the WebSocket handshake.
    pub request_timeout: Duration,
}

impl Config {
    pub fn new(group_id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn with_api_key<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    {
        self.api_key_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_auth_token<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    {
        self.auth_token_provider = Some(Arc::new(provider));
        self
    }

    /// Check the fields that cannot be defaulted.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.group_id.is_empty() {
            return Err(Error::Config(MISSING_GROUP_ID.to_string()));
        }
        if self.domain.is_empty() {
            return Err(Error::Config(MISSING_DOMAIN.to_string()));
        }
        if self.api_key_provider.is_none() && self.auth_token_provider.is_none() {
            return Err(Error::Config(MISSING_PROVIDER.to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "Config must contain a non-zero PollInterval".to_string(),
            ));
        }
        if self.consume_response_timeout.is_zero() {
            return Err(Error::Config(
                "Config must contain a non-zero ConsumeResponseTimeout".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Config(
                "Config must contain a non-zero EventChannelCapacity".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn rest_host(&self) -> &str {
        self.rest_host.as_deref().unwrap_or(&self.domain)
    }

    pub(crate) fn pubsub_host(&self) -> &str {
        self.pubsub_host.as_deref().unwrap_or(&self.domain)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            domain: String::new(),
            api_key_provider: None,
            auth_token_provider: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            consume_response_timeout: DEFAULT_CONSUME_RESPONSE_TIMEOUT,
            consume_timeout_policy: ConsumeTimeoutPolicy::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            rest_host: None,
            pubsub_host: None,
            use_tls: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("group_id", &self.group_id)
            .field("domain", &self.domain)
            .field("api_key_provider", &self.api_key_provider.is_some())
            .field("auth_token_provider", &self.auth_token_provider.is_some())
            .field("poll_interval", &self.poll_interval)
            .field("consume_response_timeout", &self.consume_response_timeout)
            .field("consume_timeout_policy", &self.consume_timeout_policy)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .field("rest_host", &self.rest_host)
            .field("pubsub_host", &self.pubsub_host)
            .field("use_tls", &self.use_tls)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// A message consumed from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned message ID.
    pub id: String,
    /// Headers attached by the publisher.
    pub headers: Headers,
    /// Decoded payload bytes.
    pub payload: Vec<u8>,
}

/// Outcome of a publish request the transport accepted.
///
/// `error` is set when the broker acknowledged the request with a failure.
#[derive(Debug)]
pub struct PublishResult {
    /// Correlation ID, identical to the one returned by `publish_async`.
    pub id: String,
    pub error: Option<Error>,
}

/// Events on the connection-wide channel, see
/// [`Connection::next_event`](crate::Connection::next_event).
#[derive(Debug)]
pub enum ConnectionEvent {
    /// An asynchronous fault: consume timeout or transport failure.
    Error(Error),
    /// Disconnect finished; every poller has exited.
    Closed,
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("Failed to obtain auth credential: {0}")]
    Auth(BoxError),

    #[error("Connection is already connected")]
    AlreadyConnected,

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Subscription for stream {0} already exists")]
    AlreadySubscribed(String),

    #[error("Subscription for stream {0} doesn't exist")]
    NotSubscribed(String),

    #[error("Failed to create subscription for {stream}: {reason}")]
    SubscriptionCreateFailed { stream: String, reason: String },

    #[error("Failed to unsubscribe from stream {stream}: {reason}")]
    SubscriptionDeleteFailed { stream: String, reason: String },

    #[error("consume error: code={code}, {message}")]
    Consume {
        id: String,
        code: i64,
        message: String,
    },

    #[error("consume decode error: {message}")]
    Decode { id: String, message: String },

    #[error("payload decode error for message {id}: {source}")]
    PayloadDecode {
        id: String,
        source: base64::DecodeError,
    },

    #[error("No consume response for stream {stream} within {timeout:?}")]
    ConsumeTimeout { stream: String, timeout: Duration },

    #[error("Failed to send publish request: {0}")]
    PublishSend(Box<Error>),

    #[error("publish rejected: code={code}, {message}")]
    PublishRemote { code: i64, message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request canceled")]
    Canceled,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
