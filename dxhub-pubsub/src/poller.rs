//! Per-subscription long-poll consume loop.
//!
//! Each iteration sends one consume request and races its response against
//! `consume_response_timeout` and the subscription's cancellation token:
//!
//! ```text
//! Polling -> AwaitingResponse -> { Delivering | Retrying | TimedOut } -> Polling
//!                      \-> Stopped (cancelled, handle dropped, timeout policy)
//! ```
//!
//! Remote consume errors and undecodable responses are delivered to the
//! subscriber and retried on the next iteration with the cursor unchanged.
//! Timeouts are never delivered to the subscriber; they surface on the
//! connection event channel once per streak of consecutive timeouts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::EventSink;
use crate::protocol::{Request, Response};
use crate::transport::Transport;
use crate::types::{ConnectionEvent, ConsumeTimeoutPolicy, Error, Message};

/// State shared by every poller of one connection.
pub(crate) struct PollerContext {
    pub transport: Arc<dyn Transport>,
    pub events: EventSink,
    pub consume_timed_out: Arc<AtomicBool>,
    pub poll_interval: Duration,
    pub consume_response_timeout: Duration,
    pub timeout_policy: ConsumeTimeoutPolicy,
}

pub(crate) type EventSender = mpsc::Sender<Result<Message, Error>>;

enum Step {
    Continue,
    Stop,
}

pub(crate) struct StreamPoller {
    ctx: Arc<PollerContext>,
    stream: String,
    subscription_id: String,
    events_tx: EventSender,
    cancel: CancellationToken,
    cursor: String,
    consecutive_timeouts: u32,
}

impl StreamPoller {
    pub fn new(
        ctx: Arc<PollerContext>,
        stream: String,
        subscription_id: String,
        events_tx: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            stream,
            subscription_id,
            events_tx,
            cancel,
            cursor: String::new(),
            consecutive_timeouts: 0,
        }
    }

    pub async fn run(mut self) {
        tracing::debug!(stream = %self.stream, "Starting stream poller");
        loop {
            if let Step::Stop = self.poll_once().await {
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.poll_interval) => {}
            }
        }
        tracing::debug!(stream = %self.stream, "Stopped stream poller");
    }

    async fn poll_once(&mut self) -> Step {
        let request = match Request::consume(&self.subscription_id, &self.cursor) {
            Ok(request) => request,
            Err(e) => return self.deliver(Err(e)).await,
        };

        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Step::Stop,
            sent = self.ctx.transport.send(request) => sent,
        };
        let handle = match sent {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(stream = %self.stream, "Failed to start consumption: {e}");
                return self.deliver(Err(e)).await;
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Step::Stop,
            response = handle => match response {
                Ok(response) => {
                    self.consecutive_timeouts = 0;
                    self.handle_response(response).await
                }
                Err(_) => {
                    tracing::warn!(stream = %self.stream, "Consume request abandoned by transport");
                    Step::Continue
                }
            },
            _ = tokio::time::sleep(self.ctx.consume_response_timeout) => self.on_timeout().await,
        }
    }

    async fn handle_response(&mut self, response: Response) -> Step {
        if let Some(err) = response.remote_error() {
            tracing::error!(stream = %self.stream, code = err.code, "Consume error: {}", err.message);
            let event = Error::Consume {
                id: response.id.clone(),
                code: err.code,
                message: err.message.clone(),
            };
            return self.deliver(Err(event)).await;
        }

        let result = match response.consume_result() {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(stream = %self.stream, "Consume error: {e}");
                return self.deliver(Err(e)).await;
            }
        };

        self.cursor = result.consume_context;
        for (stream, messages) in result.messages {
            if stream != self.stream {
                tracing::error!(
                    stream = %stream,
                    expected = %self.stream,
                    "Received consume messages for an unexpected stream"
                );
                continue;
            }
            for m in messages {
                let event = match m.decode_payload() {
                    Ok(payload) => Ok(Message {
                        id: m.msg_id,
                        headers: m.headers,
                        payload,
                    }),
                    Err(source) => Err(Error::PayloadDecode {
                        id: m.msg_id,
                        source,
                    }),
                };
                if let Step::Stop = self.deliver(event).await {
                    return Step::Stop;
                }
            }
        }
        Step::Continue
    }

    async fn on_timeout(&mut self) -> Step {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        tracing::debug!(
            stream = %self.stream,
            consecutive = self.consecutive_timeouts,
            "Did not receive consume response within timeout, trying again"
        );
        self.ctx.consume_timed_out.store(true, Ordering::SeqCst);
        if self.consecutive_timeouts == 1 {
            self.ctx
                .events
                .emit(ConnectionEvent::Error(Error::ConsumeTimeout {
                    stream: self.stream.clone(),
                    timeout: self.ctx.consume_response_timeout,
                }))
                .await;
        }
        match self.ctx.timeout_policy {
            ConsumeTimeoutPolicy::StopAfter(limit) if self.consecutive_timeouts >= limit => {
                tracing::warn!(
                    stream = %self.stream,
                    limit,
                    "Stopping stream poller after consecutive consume timeouts"
                );
                Step::Stop
            }
            _ => Step::Continue,
        }
    }

    /// Hand one event to the subscriber. Stops when cancelled or when the
    /// subscriber dropped its handle.
    async fn deliver(&self, event: Result<Message, Error>) -> Step {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Step::Stop,
            sent = self.events_tx.send(event) => match sent {
                Ok(()) => Step::Continue,
                Err(_) => {
                    tracing::debug!(stream = %self.stream, "Subscription handle dropped, stopping poller");
                    Step::Stop
                }
            },
        }
    }
}
