//! Connection management: lifecycle state, the connection event channel, and
//! the entry points for subscribing and publishing.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::task::TaskTracker;

use crate::auth::AuthHeader;
use crate::poller::PollerContext;
use crate::publish::{PublishCancel, PublishCoordinator};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::rest::{RestSubscriptionApi, SubscriptionApi};
use crate::transport::{Transport, WsTransport};
use crate::types::{Config, ConnectionEvent, Error, Headers, MISSING_PROVIDER, PublishResult};

/// How long a producer waits on a full event channel before dropping.
const EVENT_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Producer side of the connection event channel.
///
/// Handed to the transport and every poller. When the channel is full the
/// producer waits briefly, then drops the event.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<ConnectionEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<ConnectionEvent>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: ConnectionEvent) {
        match self.tx.send_timeout(event, EVENT_SEND_TIMEOUT).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(event)) => {
                tracing::warn!(?event, "Connection event channel full, dropping event");
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::debug!("Connection event channel closed");
            }
        }
    }

    pub(crate) fn try_send(&self, event: ConnectionEvent) -> Result<(), TrySendError<ConnectionEvent>> {
        self.tx.try_send(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Client for one consumer group on one broker.
///
/// Share it behind an `Arc`; every method takes `&self`. Dropping a
/// connection without calling [`disconnect`](Connection::disconnect) cancels
/// the pollers but leaves the remote subscriptions in place.
pub struct Connection {
    auth: AuthHeader,
    state: Mutex<ConnectionState>,
    /// Serializes connect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
    transport: Arc<dyn Transport>,
    registry: SubscriptionRegistry,
    publisher: PublishCoordinator,
    tasks: TaskTracker,
    events: EventSink,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<ConnectionEvent>>,
    consume_timed_out: Arc<AtomicBool>,
}

/// Puts the state back to `Disconnected` if connect fails or is dropped.
struct ConnectingGuard<'a> {
    state: &'a Mutex<ConnectionState>,
    committed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            *self.state.lock() = ConnectionState::Disconnected;
        }
    }
}

impl Connection {
    /// Validate `config` and build a connection over WebSocket and HTTPS.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let transport = Arc::new(WsTransport::from_config(&config)?);
        let api = Arc::new(RestSubscriptionApi::from_config(&config)?);
        Self::with_collaborators(config, transport, api)
    }

    /// Build a connection on custom collaborators.
    pub fn with_collaborators(
        config: Config,
        transport: Arc<dyn Transport>,
        api: Arc<dyn SubscriptionApi>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let auth = AuthHeader::select(&config)
            .ok_or_else(|| Error::Config(MISSING_PROVIDER.to_string()))?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let events = EventSink::new(tx);
        let consume_timed_out = Arc::new(AtomicBool::new(false));
        let tasks = TaskTracker::new();

        let ctx = Arc::new(PollerContext {
            transport: transport.clone(),
            events: events.clone(),
            consume_timed_out: consume_timed_out.clone(),
            poll_interval: config.poll_interval,
            consume_response_timeout: config.consume_response_timeout,
            timeout_policy: config.consume_timeout_policy,
        });
        let registry = SubscriptionRegistry::new(
            api,
            auth.clone(),
            config.group_id,
            ctx,
            tasks.clone(),
            config.event_channel_capacity,
        );

        Ok(Self {
            auth,
            state: Mutex::new(ConnectionState::Disconnected),
            lifecycle: tokio::sync::Mutex::new(()),
            publisher: PublishCoordinator::new(transport.clone()),
            transport,
            registry,
            tasks,
            events,
            events_rx: tokio::sync::Mutex::new(rx),
            consume_timed_out,
        })
    }

    /// Establish the transport session.
    pub async fn connect(&self) -> Result<(), Error> {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(Error::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }
        let mut guard = ConnectingGuard {
            state: &self.state,
            committed: false,
        };

        let credential = self.auth.credential().inspect_err(|e| {
            tracing::error!("Failed to obtain auth header: {e}");
        })?;
        self.transport
            .connect(&credential, self.events.clone())
            .await
            .inspect_err(|e| {
                tracing::error!("Failed to connect: {e}");
            })?;

        self.consume_timed_out.store(false, Ordering::SeqCst);
        self.tasks.reopen();
        self.registry.open();
        *self.state.lock() = ConnectionState::Connected;
        guard.committed = true;
        tracing::info!(header = self.auth.name(), "Connected");
        Ok(())
    }

    /// Unsubscribe from every stream, wait for every poller to exit, fail the
    /// outstanding publishes and close the transport. A no-op when already
    /// disconnected. Emits [`ConnectionEvent::Closed`] once done.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnecting;
        }
        tracing::debug!("Disconnecting");

        self.registry.teardown_all().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.publisher.cancel_all();
        self.transport.close().await;

        *self.state.lock() = ConnectionState::Disconnected;
        self.emit_closed().await;
        tracing::info!("Disconnected");
    }

    /// Create a subscription to `stream` and start consuming it.
    pub async fn subscribe(&self, stream: &str) -> Result<Subscription, Error> {
        self.ensure_connected()?;
        self.registry.subscribe(stream).await
    }

    /// Delete the subscription to `stream`. The poller has exited when this
    /// returns `Ok`. On failure the subscription is kept and may be retried.
    pub async fn unsubscribe(&self, stream: &str) -> Result<(), Error> {
        self.ensure_connected()?;
        self.registry.unsubscribe(stream).await
    }

    /// Publish and wait up to `timeout` for the broker's acknowledgement.
    ///
    /// `Err` means the publish was never accepted or never resolved. A
    /// broker-side rejection is reported in [`PublishResult::error`].
    pub async fn publish(
        &self,
        stream: &str,
        headers: &Headers,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<PublishResult, Error> {
        self.ensure_connected()
            .map_err(|e| Error::PublishSend(Box::new(e)))?;
        self.publisher
            .publish(stream, headers, payload, timeout)
            .await
    }

    /// Publish without waiting. The acknowledgement is sent to `ack_tx`
    /// unless canceled first through the returned [`PublishCancel`].
    pub async fn publish_async(
        &self,
        stream: &str,
        headers: &Headers,
        payload: &[u8],
        ack_tx: mpsc::Sender<PublishResult>,
    ) -> Result<(String, PublishCancel), Error> {
        self.ensure_connected()
            .map_err(|e| Error::PublishSend(Box::new(e)))?;
        self.publisher
            .publish_async(stream, headers, payload, ack_tx)
            .await
    }

    /// Receive the next connection event: a consume timeout, a transport
    /// fault, or [`ConnectionEvent::Closed`] after a disconnect.
    pub async fn next_event(&self) -> Option<ConnectionEvent> {
        self.events_rx.lock().await.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Whether any consume request went unanswered since the last connect.
    pub fn consume_timed_out(&self) -> bool {
        self.consume_timed_out.load(Ordering::SeqCst)
    }

    /// Streams with a live subscription, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.registry.streams()
    }

    pub fn subscription_id(&self, stream: &str) -> Option<String> {
        self.registry.subscription_id(stream)
    }

    /// Number of publishes awaiting an acknowledgement.
    pub fn pending_publishes(&self) -> usize {
        self.publisher.pending()
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    /// The sentinel must not be lost: on a full channel the oldest event
    /// makes room for it.
    async fn emit_closed(&self) {
        let Err(TrySendError::Full(_)) = self.events.try_send(ConnectionEvent::Closed) else {
            return;
        };
        if let Ok(mut rx) = self.events_rx.try_lock()
            && let Ok(oldest) = rx.try_recv()
        {
            tracing::warn!(event = ?oldest, "Connection event channel full, dropping oldest event");
        }
        self.events.emit(ConnectionEvent::Closed).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("auth", &self.auth)
            .field("subscriptions", &self.subscriptions())
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.cancel_all();
    }
}
