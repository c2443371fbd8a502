//! Publish with request/response correlation.
//!
//! Every accepted publish owns one entry in the pending table, keyed by its
//! correlation ID. Whoever removes the entry decides its fate: the completion
//! task delivers the ack, while a cancel or an abandoned waiter drops it.
//! That single removal is what makes delivery at-most-once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{Request, Response};
use crate::transport::{ResponseHandle, Transport};
use crate::types::{Error, Headers, PublishResult};

#[derive(Debug)]
enum AckTarget {
    /// A blocked `publish` call.
    Waiter(oneshot::Sender<PublishResult>),
    /// The caller-supplied channel of `publish_async`.
    Channel(mpsc::Sender<PublishResult>),
}

type PendingTable = Arc<Mutex<HashMap<String, AckTarget>>>;

pub(crate) struct PublishCoordinator {
    transport: Arc<dyn Transport>,
    pending: PendingTable,
}

/// Cancels one `publish_async` acknowledgement.
///
/// Cheap to clone; cancelling is idempotent and never blocks.
#[derive(Clone, Debug)]
pub struct PublishCancel {
    id: String,
    pending: PendingTable,
}

impl PublishCancel {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drop the acknowledgement if it has not been delivered yet.
    pub fn cancel(&self) {
        if self.pending.lock().remove(&self.id).is_some() {
            tracing::debug!(id = %self.id, "Publish acknowledgement canceled");
        }
    }
}

/// Removes the pending entry when a blocking publish returns or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(self.id);
    }
}

impl PublishCoordinator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn publish(
        &self,
        stream: &str,
        headers: &Headers,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<PublishResult, Error> {
        let request = Request::publish(stream, headers, payload)?;
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), AckTarget::Waiter(tx));
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        let handle = self
            .transport
            .send(request)
            .await
            .map_err(|e| Error::PublishSend(Box::new(e)))?;
        self.spawn_completion(id.clone(), handle);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(Error::Canceled),
            Err(_) => {
                tracing::debug!(id = %id, stream, "Publish acknowledgement timed out");
                Err(Error::Timeout(timeout))
            }
        }
    }

    pub async fn publish_async(
        &self,
        stream: &str,
        headers: &Headers,
        payload: &[u8],
        ack_tx: mpsc::Sender<PublishResult>,
    ) -> Result<(String, PublishCancel), Error> {
        let request = Request::publish(stream, headers, payload)?;
        let id = request.id.clone();
        self.pending
            .lock()
            .insert(id.clone(), AckTarget::Channel(ack_tx));

        let handle = match self.transport.send(request).await {
            Ok(handle) => handle,
            Err(e) => {
                self.pending.lock().remove(&id);
                return Err(Error::PublishSend(Box::new(e)));
            }
        };
        self.spawn_completion(id.clone(), handle);

        let cancel = PublishCancel {
            id: id.clone(),
            pending: self.pending.clone(),
        };
        Ok((id, cancel))
    }

    /// Fail every outstanding publish with `Canceled`. Blocked calls return
    /// the error; async callers get a `PublishResult` carrying it.
    pub fn cancel_all(&self) {
        let drained: Vec<(String, AckTarget)> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Canceling pending publishes");
        }
        for (id, target) in drained {
            if let AckTarget::Channel(tx) = target {
                let result = PublishResult {
                    id,
                    error: Some(Error::Canceled),
                };
                if let Err(e) = tx.try_send(result) {
                    tracing::warn!("Dropping publish cancellation: {e}");
                }
            }
        }
    }

    /// Wait for the broker's response to `id` and route it to whoever is
    /// still registered for it.
    fn spawn_completion(&self, id: String, handle: ResponseHandle) {
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let response = handle.await;
            let Some(target) = pending.lock().remove(&id) else {
                tracing::debug!(id = %id, "Dropping acknowledgement nobody waits for");
                return;
            };
            match (target, response) {
                (AckTarget::Waiter(tx), Ok(response)) => {
                    let _ = tx.send(ack_result(&id, &response));
                }
                // Dropping the sender fails the blocked call with `Canceled`.
                (AckTarget::Waiter(_), Err(_)) => {}
                (AckTarget::Channel(tx), response) => {
                    let result = match response {
                        Ok(response) => ack_result(&id, &response),
                        Err(_) => PublishResult {
                            id,
                            error: Some(Error::Canceled),
                        },
                    };
                    if tx.send(result).await.is_err() {
                        tracing::debug!("Acknowledgement channel closed");
                    }
                }
            }
        });
    }
}

fn ack_result(id: &str, response: &Response) -> PublishResult {
    let error = response.remote_error().map(|e| Error::PublishRemote {
        code: e.code,
        message: e.message.clone(),
    });
    PublishResult {
        id: id.to_string(),
        error,
    }
}
