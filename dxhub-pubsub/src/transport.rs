//! Message transport: the [`Transport`] seam and its WebSocket implementation.
//!
//! A transport owns session establishment and the framing of requests. The
//! engine only sees one-shot response handles, so request/response
//! multiplexing lives entirely here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

use crate::auth::AuthCredential;
use crate::connection::EventSink;
use crate::protocol::{Request, Response, decode_response, encode_request};
use crate::types::{Config, ConnectionEvent, Error};

pub(crate) const PUBSUB_PATH: &str = "/api/v2/pubsub";
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Resolves once with the response to one request. Dropped by the transport
/// when the request can no longer be answered (e.g. the session closed).
pub type ResponseHandle = oneshot::Receiver<Response>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the session. Asynchronous faults seen afterwards are
    /// reported on `events`.
    async fn connect(&self, credential: &AuthCredential, events: EventSink) -> Result<(), Error>;

    /// Send one request and register interest in its response.
    async fn send(&self, request: Request) -> Result<ResponseHandle, Error>;

    /// Tear the session down. Every outstanding response handle is dropped.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>;

struct Session {
    outbound: mpsc::Sender<String>,
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// JSON-RPC over a single WebSocket, responses matched to requests by ID.
pub struct WsTransport {
    url: String,
    handshake_timeout: Duration,
    session: Mutex<Option<Session>>,
    pending: PendingRequests,
}

pub(crate) fn build_pubsub_url(config: &Config) -> Result<String, Error> {
    let scheme = if config.use_tls { "wss" } else { "ws" };
    let mut u = url::Url::parse(&format!(
        "{scheme}://{}{PUBSUB_PATH}",
        config.pubsub_host()
    ))?;
    u.query_pairs_mut().append_pair("groupId", &config.group_id);
    Ok(u.to_string())
}

impl WsTransport {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            url: build_pubsub_url(config)?,
            handshake_timeout: config.request_timeout,
            session: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, credential: &AuthCredential, events: EventSink) -> Result<(), Error> {
        if self.session.lock().is_some() {
            return Err(Error::AlreadyConnected);
        }

        let mut request = self.url.as_str().into_client_request()?;
        let name = HeaderName::from_bytes(credential.header.as_bytes())
            .map_err(|e| Error::Auth(Box::new(e)))?;
        let value =
            HeaderValue::from_bytes(&credential.value).map_err(|e| Error::Auth(Box::new(e)))?;
        request.headers_mut().insert(name, value);

        let ws = match tokio::time::timeout(
            self.handshake_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((ws, _resp))) => ws,
            Ok(Err(tungstenite::Error::Http(resp))) => {
                return Err(Error::ConnectionRejected(format!(
                    "handshake answered with {}",
                    resp.status()
                )));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(Error::Transport(format!(
                    "handshake timed out after {:?}",
                    self.handshake_timeout
                )));
            }
        };
        let (ws_write, ws_read) = ws.split();

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_io_loop(
            ws_write,
            ws_read,
            outbound_rx,
            close_rx,
            self.pending.clone(),
            events,
        ));

        let mut session = self.session.lock();
        if session.is_some() {
            // Lost a race with a concurrent connect; the new loop exits once
            // `close_tx` drops.
            task.abort();
            return Err(Error::AlreadyConnected);
        }
        *session = Some(Session {
            outbound,
            close_tx: Some(close_tx),
            task,
        });
        tracing::debug!(url = %self.url, "WebSocket session established");
        Ok(())
    }

    async fn send(&self, request: Request) -> Result<ResponseHandle, Error> {
        let outbound = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.outbound.clone())
            .ok_or(Error::NotConnected)?;
        let frame = encode_request(&request)?;

        let rx = register(&self.pending, &request.id);
        if outbound.send(frame).await.is_err() {
            self.pending.lock().remove(&request.id);
            return Err(Error::Transport("session closed".to_string()));
        }
        Ok(rx)
    }

    async fn close(&self) {
        let session = self.session.lock().take();
        if let Some(mut session) = session {
            if let Some(tx) = session.close_tx.take() {
                let _ = tx.send(());
            }
            if let Err(e) = session.task.await {
                tracing::warn!("WebSocket I/O task ended abnormally: {e}");
            }
        }
        self.pending.lock().clear();
    }
}

/// Track a response waiter for `id`. Waiters whose handle was dropped (a
/// timed out consume, a canceled publish) are pruned first.
fn register(pending: &PendingRequests, id: &str) -> ResponseHandle {
    let (tx, rx) = oneshot::channel();
    let mut pending = pending.lock();
    pending.retain(|_, waiter| !waiter.is_closed());
    pending.insert(id.to_string(), tx);
    rx
}

async fn run_io_loop(
    mut ws_write: WsWrite,
    mut ws_read: WsRead,
    mut outbound_rx: mpsc::Receiver<String>,
    mut close_rx: oneshot::Receiver<()>,
    pending: PendingRequests,
    events: EventSink,
) {
    loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match decode_response(text.as_str()) {
                            Ok(response) => {
                                let waiter = pending.lock().remove(&response.id);
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(response);
                                    }
                                    None => {
                                        tracing::debug!(id = %response.id, "Dropping response for unknown request");
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Failed to decode response frame: {e}");
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        tracing::info!(?frame, "WebSocket closed by broker");
                        events
                            .emit(ConnectionEvent::Error(Error::Transport(
                                "connection closed by broker".to_string(),
                            )))
                            .await;
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ignore binary, ping, pong frames
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {e}");
                        events.emit(ConnectionEvent::Error(e.into())).await;
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        events
                            .emit(ConnectionEvent::Error(Error::Transport(
                                "connection lost".to_string(),
                            )))
                            .await;
                        break;
                    }
                }
            }

            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = ws_write.send(tungstenite::Message::Text(frame.into())).await {
                    tracing::warn!("Failed to write request frame: {e}");
                    events.emit(ConnectionEvent::Error(e.into())).await;
                    break;
                }
            }

            _ = &mut close_rx => {
                tracing::debug!("Close requested");
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                break;
            }
        }
    }

    // Refuse new requests before failing the outstanding ones.
    drop(outbound_rx);
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new("my group", "dxhub.example.com").with_api_key(|| Ok(b"k".to_vec()))
    }

    #[test]
    fn pubsub_url_uses_wss_and_group() {
        let url = build_pubsub_url(&config()).unwrap();
        assert_eq!(
            url,
            "wss://dxhub.example.com/api/v2/pubsub?groupId=my+group"
        );
    }

    #[test]
    fn pubsub_url_honours_host_override_and_plain_ws() {
        let mut config = config();
        config.pubsub_host = Some("127.0.0.1:9000".to_string());
        config.use_tls = false;
        let url = build_pubsub_url(&config).unwrap();
        assert!(url.starts_with("ws://127.0.0.1:9000/api/v2/pubsub?"));
    }

    #[test]
    fn invalid_host_is_url_error() {
        let mut config = config();
        config.pubsub_host = Some("bad host:port".to_string());
        assert!(matches!(build_pubsub_url(&config), Err(Error::Url(_))));
    }

    #[test]
    fn abandoned_waiters_are_pruned_on_register() {
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let abandoned = register(&pending, "req-1");
        let _live = register(&pending, "req-2");
        drop(abandoned);

        let _next = register(&pending, "req-3");
        let mut ids: Vec<String> = pending.lock().keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["req-2", "req-3"]);
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let transport = WsTransport::from_config(&config()).unwrap();
        let req = Request::consume("sub-1", "").unwrap();
        assert!(matches!(
            transport.send(req).await,
            Err(Error::NotConnected)
        ));
        // Closing an idle transport is a no-op.
        transport.close().await;
    }
}
