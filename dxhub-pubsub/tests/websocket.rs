use std::time::Duration;

use dxhub_pubsub::protocol::{
    ConsumeParams, PublishParams, Response, decode_request, encode_response, method,
};
use dxhub_pubsub::{Config, Connection, ConnectionEvent, Error, Headers};
use futures_util::{SinkExt, StreamExt};
use httpmock::prelude::*;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;

const WAIT: Duration = Duration::from_secs(5);
const API_KEY: &str = "secret";

// ---------------------------------------------------------------------------
// Mock pub/sub endpoint
// ---------------------------------------------------------------------------

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

struct MockPubSubServer {
    listener: TcpListener,
    port: u16,
}

impl MockPubSubServer {
    async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    /// Accept one session, refusing the upgrade unless it carries the API
    /// key header and the group query.
    async fn accept(&self) -> Result<WsStream, Box<dyn std::error::Error>> {
        let (tcp, _) = self.listener.accept().await?;
        let ws = tokio_tungstenite::accept_hdr_async(
            tcp,
            |req: &Request, resp: HandshakeResponse| {
                let authorized = req
                    .headers()
                    .get("x-api-key")
                    .is_some_and(|v| v.as_bytes() == API_KEY.as_bytes());
                let group = req.uri().query() == Some("groupId=group");
                if authorized && group {
                    Ok(resp)
                } else {
                    let mut err = ErrorResponse::new(Some("unauthorized".to_string()));
                    *err.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(err)
                }
            },
        )
        .await?;
        Ok(ws)
    }
}

/// Answer JSON-RPC requests for a single stream named `orders` until the
/// client goes away. Consume cursors are offsets into the published log.
async fn serve(mut ws: WsStream) {
    let mut log: Vec<String> = Vec::new();
    while let Some(Ok(frame)) = ws.next().await {
        let tungstenite::Message::Text(text) = frame else {
            continue;
        };
        let request = decode_request(text.as_str()).unwrap();
        let response = match request.method.as_str() {
            method::PUBLISH => {
                let params: PublishParams = serde_json::from_value(request.params).unwrap();
                log.push(params.payload);
                Response::success(request.id, serde_json::json!({}))
            }
            method::CONSUME => {
                let params: ConsumeParams = serde_json::from_value(request.params).unwrap();
                let offset: usize = params.consume_context.parse().unwrap_or(0);
                let batch: Vec<serde_json::Value> = log
                    .iter()
                    .enumerate()
                    .skip(offset)
                    .map(|(i, payload)| {
                        serde_json::json!({"msgId": format!("m{i}"), "payload": payload})
                    })
                    .collect();
                Response::success(
                    request.id,
                    serde_json::json!({
                        "consumeContext": log.len().to_string(),
                        "messages": {"orders": batch},
                    }),
                )
            }
            _ => Response::failure(request.id, -32601, "method not found"),
        };
        let frame = tungstenite::Message::Text(encode_response(&response).unwrap().into());
        if ws.send(frame).await.is_err() {
            break;
        }
    }
}

fn test_config(ws: &MockPubSubServer, http: &MockServer) -> Config {
    let mut config = Config::new("group", "dxhub.test").with_api_key(|| Ok(API_KEY.into()));
    config.pubsub_host = Some(format!("127.0.0.1:{}", ws.port));
    config.rest_host = Some(format!("127.0.0.1:{}", http.port()));
    config.use_tls = false;
    config.poll_interval = Duration::from_millis(10);
    config
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_publish_consume_over_websocket() {
    let http = MockServer::start_async().await;
    let ws = MockPubSubServer::start().await.unwrap();
    let config = test_config(&ws, &http);

    let create = http
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/v2/subscriptions")
                .header("x-api-key", API_KEY)
                .json_body(serde_json::json!({"groupId": "group", "streams": ["orders"]}));
            then.status(201)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({"_id": "sub-1"}));
        })
        .await;
    let delete = http
        .mock_async(|when, then| {
            when.method(DELETE)
                .path("/api/v2/subscriptions/sub-1")
                .header("x-api-key", API_KEY);
            then.status(204);
        })
        .await;

    let server = tokio::spawn(async move {
        let session = ws.accept().await.unwrap();
        serve(session).await;
    });

    let conn = Connection::new(config).unwrap();
    conn.connect().await.unwrap();
    let mut sub = conn.subscribe("orders").await.unwrap();
    assert_eq!(sub.id(), "sub-1");

    let result = conn
        .publish("orders", &Headers::new(), b"hello", WAIT)
        .await
        .unwrap();
    assert!(result.error.is_none());

    let msg = tokio::time::timeout(WAIT, sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg.id, "m0");
    assert_eq!(msg.payload, b"hello");

    conn.unsubscribe("orders").await.unwrap();
    create.assert_async().await;
    delete.assert_async().await;

    conn.disconnect().await;
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn rejected_upgrade_is_connection_rejected() {
    let http = MockServer::start_async().await;
    let ws = MockPubSubServer::start().await.unwrap();
    let mut config = test_config(&ws, &http);
    config.api_key_provider = None;
    let config = config.with_api_key(|| Ok(b"wrong".to_vec()));

    tokio::spawn(async move {
        let _ = ws.accept().await;
    });

    let conn = Connection::new(config).unwrap();
    match conn.connect().await {
        Err(Error::ConnectionRejected(reason)) => assert!(reason.contains("401")),
        other => panic!("expected ConnectionRejected, got {other:?}"),
    }
    assert!(conn.is_disconnected());
}

#[tokio::test]
async fn failed_create_is_subscription_create_failed() {
    let http = MockServer::start_async().await;
    let ws = MockPubSubServer::start().await.unwrap();
    let config = test_config(&ws, &http);

    let create = http
        .mock_async(|when, then| {
            when.method(POST).path("/api/v2/subscriptions");
            then.status(500);
        })
        .await;

    tokio::spawn(async move {
        let session = ws.accept().await.unwrap();
        serve(session).await;
    });

    let conn = Connection::new(config).unwrap();
    conn.connect().await.unwrap();
    match conn.subscribe("orders").await {
        Err(Error::SubscriptionCreateFailed { stream, reason }) => {
            assert_eq!(stream, "orders");
            assert!(reason.contains("500"));
        }
        other => panic!("expected SubscriptionCreateFailed, got {other:?}"),
    }
    assert!(conn.subscriptions().is_empty());
    create.assert_async().await;
    conn.disconnect().await;
}

#[tokio::test]
async fn broker_close_surfaces_on_event_channel() {
    let http = MockServer::start_async().await;
    let ws = MockPubSubServer::start().await.unwrap();
    let config = test_config(&ws, &http);

    tokio::spawn(async move {
        let mut session = ws.accept().await.unwrap();
        let _ = session.close(None).await;
        // Drain until the client acknowledges the close.
        while let Some(Ok(_)) = session.next().await {}
    });

    let conn = Connection::new(config).unwrap();
    conn.connect().await.unwrap();

    match tokio::time::timeout(WAIT, conn.next_event()).await.unwrap() {
        Some(ConnectionEvent::Error(Error::Transport(reason))) => {
            assert_eq!(reason, "connection closed by broker");
        }
        other => panic!("expected transport error, got {other:?}"),
    }

    // The session is gone, so requests are refused.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        conn.publish("orders", &Headers::new(), b"p", WAIT).await,
        Err(Error::PublishSend(_))
    ));

    conn.disconnect().await;
    assert!(matches!(
        tokio::time::timeout(WAIT, conn.next_event()).await,
        Ok(Some(ConnectionEvent::Closed))
    ));
}
