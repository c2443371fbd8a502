//! DxHub pub/sub client engine.
//!
//! Maintains one authenticated session to a DxHub stream broker and on top
//! of it implements stream subscriptions with long-poll consumption and
//! publishing with request/response correlation.
//!
//! # Features
//! - API key or auth token authentication, resolved on every request
//! - One cancellable long-poll consumer per subscribed stream
//! - Blocking publish with a deadline, or fire-and-forget publish with a
//!   cancellable acknowledgement
//! - JSON-RPC over a single WebSocket session
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), dxhub_pubsub::Error> {
//! use std::time::Duration;
//!
//! use dxhub_pubsub::{Config, Connection, Headers};
//!
//! let config = Config::new("my-group", "dxhub.example.com")
//!     .with_api_key(|| Ok(b"secret".to_vec()));
//! let conn = Connection::new(config)?;
//! conn.connect().await?;
//!
//! let mut sub = conn.subscribe("orders").await?;
//! let result = conn
//!     .publish("orders", &Headers::new(), b"hello", Duration::from_secs(5))
//!     .await?;
//! println!("published {}", result.id);
//!
//! if let Some(Ok(msg)) = sub.next().await {
//!     println!("got {} ({} bytes)", msg.id, msg.payload.len());
//! }
//! conn.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod auth;
mod connection;
mod poller;
pub mod protocol;
mod publish;
mod registry;
mod rest;
mod transport;
mod types;

pub use auth::{API_KEY_HEADER, AUTH_TOKEN_HEADER, AuthCredential, AuthHeader};
pub use connection::{Connection, ConnectionState, EventSink};
pub use publish::PublishCancel;
pub use registry::Subscription;
pub use rest::{RestSubscriptionApi, SubscriptionApi, SubscriptionRequest, SubscriptionResponse};
pub use transport::{ResponseHandle, Transport, WsTransport};
pub use types::{
    BoxError, Config, ConnectionEvent, ConsumeTimeoutPolicy, CredentialProvider, Error, Headers,
    Message, PublishResult,
};
