//! Subscription registry: stream name to live subscription.
//!
//! The table lock is never held across a REST call or a poller join. A
//! create or delete in flight parks its stream in a transitional slot, so a
//! concurrent call for the same stream sees it as taken without waiting on
//! the network.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::AuthHeader;
use crate::poller::{PollerContext, StreamPoller};
use crate::rest::SubscriptionApi;
use crate::types::{Error, Message};

/// Handle to a live subscription.
///
/// Yields every message (or per-poll error) consumed for the stream, in
/// broker order. Returns `None` once the poller has exited and the buffered
/// events are drained.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    stream: String,
    rx: mpsc::Receiver<Result<Message, Error>>,
}

impl Subscription {
    /// Server-assigned subscription ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Receive the next event.
    pub async fn next(&mut self) -> Option<Result<Message, Error>> {
        self.rx.recv().await
    }
}

struct ActiveSubscription {
    id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    /// Cancel the poller and wait for it to exit.
    async fn stop(self, stream: &str) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(stream, "Stream poller ended abnormally: {e}");
        }
    }
}

enum Slot {
    /// Remote create in flight.
    Creating,
    Active(ActiveSubscription),
    /// Remote delete in flight; back to `Active` if it fails.
    Deleting(ActiveSubscription),
}

struct Table {
    slots: HashMap<String, Slot>,
    /// Cleared by teardown so no poller is spawned while shutting down.
    open: bool,
}

pub(crate) struct SubscriptionRegistry {
    table: Mutex<Table>,
    api: Arc<dyn SubscriptionApi>,
    auth: AuthHeader,
    group_id: String,
    ctx: Arc<PollerContext>,
    tasks: TaskTracker,
    event_capacity: usize,
}

/// Releases a `Creating` slot if subscribe bails out (or is dropped) before
/// committing it.
struct Reservation<'a> {
    table: &'a Mutex<Table>,
    stream: &'a str,
    committed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut table = self.table.lock();
        if matches!(table.slots.get(self.stream), Some(Slot::Creating)) {
            table.slots.remove(self.stream);
        }
    }
}

impl SubscriptionRegistry {
    pub fn new(
        api: Arc<dyn SubscriptionApi>,
        auth: AuthHeader,
        group_id: String,
        ctx: Arc<PollerContext>,
        tasks: TaskTracker,
        event_capacity: usize,
    ) -> Self {
        Self {
            table: Mutex::new(Table {
                slots: HashMap::new(),
                open: false,
            }),
            api,
            auth,
            group_id,
            ctx,
            tasks,
            event_capacity,
        }
    }

    /// Accept subscriptions again after a (re)connect.
    pub fn open(&self) {
        self.table.lock().open = true;
    }

    pub fn streams(&self) -> Vec<String> {
        let table = self.table.lock();
        let mut streams: Vec<String> = table
            .slots
            .iter()
            .filter(|(_, slot)| !matches!(slot, Slot::Creating))
            .map(|(stream, _)| stream.clone())
            .collect();
        streams.sort();
        streams
    }

    pub fn subscription_id(&self, stream: &str) -> Option<String> {
        match self.table.lock().slots.get(stream) {
            Some(Slot::Active(sub) | Slot::Deleting(sub)) => Some(sub.id.clone()),
            _ => None,
        }
    }

    pub async fn subscribe(&self, stream: &str) -> Result<Subscription, Error> {
        {
            let mut table = self.table.lock();
            if !table.open {
                return Err(Error::NotConnected);
            }
            if table.slots.contains_key(stream) {
                return Err(Error::AlreadySubscribed(stream.to_string()));
            }
            table.slots.insert(stream.to_string(), Slot::Creating);
        }
        let mut reservation = Reservation {
            table: &self.table,
            stream,
            committed: false,
        };

        let id = self.create_remote(stream).await?;

        let (events_tx, rx) = mpsc::channel(self.event_capacity);
        let cancel = CancellationToken::new();
        let accepted = {
            let mut table = self.table.lock();
            if table.open {
                let poller = StreamPoller::new(
                    self.ctx.clone(),
                    stream.to_string(),
                    id.clone(),
                    events_tx,
                    cancel.clone(),
                );
                let task = self.tasks.spawn(poller.run());
                table.slots.insert(
                    stream.to_string(),
                    Slot::Active(ActiveSubscription {
                        id: id.clone(),
                        cancel,
                        task,
                    }),
                );
                reservation.committed = true;
            }
            table.open
        };

        if !accepted {
            drop(reservation);
            tracing::debug!(stream, id = %id, "Connection closing, deleting new subscription");
            if let Err(e) = self.delete_remote(stream, &id).await {
                tracing::warn!(stream, "Failed to delete subscription created during shutdown: {e}");
            }
            return Err(Error::NotConnected);
        }

        tracing::debug!(stream, id = %id, "Subscribed");
        Ok(Subscription {
            id,
            stream: stream.to_string(),
            rx,
        })
    }

    pub async fn unsubscribe(&self, stream: &str) -> Result<(), Error> {
        tracing::debug!(stream, "Unsubscribing");
        let id = {
            let mut table = self.table.lock();
            match table.slots.remove(stream) {
                Some(Slot::Active(sub)) => {
                    let id = sub.id.clone();
                    table.slots.insert(stream.to_string(), Slot::Deleting(sub));
                    id
                }
                Some(other) => {
                    table.slots.insert(stream.to_string(), other);
                    return Err(Error::NotSubscribed(stream.to_string()));
                }
                None => return Err(Error::NotSubscribed(stream.to_string())),
            }
        };

        if let Err(e) = self.delete_remote(stream, &id).await {
            // Teardown may have started (and cancelled the poller) while the
            // delete was in flight; the subscription is then dropped locally.
            let abandoned = {
                let mut table = self.table.lock();
                match table.slots.remove(stream) {
                    Some(Slot::Deleting(sub)) if table.open && !sub.cancel.is_cancelled() => {
                        table.slots.insert(stream.to_string(), Slot::Active(sub));
                        None
                    }
                    Some(Slot::Deleting(sub)) => Some(sub),
                    Some(other) => {
                        table.slots.insert(stream.to_string(), other);
                        None
                    }
                    None => None,
                }
            };
            if let Some(sub) = abandoned {
                tracing::warn!(stream, "Connection closing, dropping subscription locally: {e}");
                sub.stop(stream).await;
            }
            return Err(e);
        }

        let removed = match self.table.lock().slots.remove(stream) {
            Some(Slot::Deleting(sub)) => Some(sub),
            _ => None,
        };
        if let Some(sub) = removed {
            sub.stop(stream).await;
        }
        tracing::debug!(stream, "Successfully unsubscribed");
        Ok(())
    }

    /// Unsubscribe everything and refuse new subscriptions. Failures are
    /// logged and the subscription is torn down locally regardless, so the
    /// table always ends empty of pollers.
    ///
    /// Pollers of subscriptions already being deleted by a concurrent
    /// unsubscribe are cancelled here; that unsubscribe finishes removing
    /// them.
    pub async fn teardown_all(&self) {
        let streams: Vec<String> = {
            let mut table = self.table.lock();
            table.open = false;
            let mut active = Vec::new();
            for (stream, slot) in &table.slots {
                match slot {
                    Slot::Active(_) => active.push(stream.clone()),
                    Slot::Deleting(sub) => sub.cancel.cancel(),
                    Slot::Creating => {}
                }
            }
            active
        };

        for stream in streams {
            if let Err(e) = self.unsubscribe(&stream).await {
                tracing::warn!(stream = %stream, "Unsubscribe failed during teardown: {e}");
                let removed = match self.table.lock().slots.remove(&stream) {
                    Some(Slot::Active(sub) | Slot::Deleting(sub)) => Some(sub),
                    _ => None,
                };
                if let Some(sub) = removed {
                    sub.stop(&stream).await;
                }
            }
        }
    }

    /// Signal every poller to stop without waiting for it.
    pub fn cancel_all(&self) {
        let table = self.table.lock();
        for slot in table.slots.values() {
            if let Slot::Active(sub) | Slot::Deleting(sub) = slot {
                sub.cancel.cancel();
            }
        }
    }

    async fn create_remote(&self, stream: &str) -> Result<String, Error> {
        let credential = self.auth.credential().inspect_err(|e| {
            tracing::error!(stream, "Failed to obtain auth header: {e}");
        })?;
        let id = self
            .api
            .create(&credential, &self.group_id, stream)
            .await
            .map_err(|e| Error::SubscriptionCreateFailed {
                stream: stream.to_string(),
                reason: e.to_string(),
            })?;
        if id.is_empty() {
            return Err(Error::SubscriptionCreateFailed {
                stream: stream.to_string(),
                reason: "Received empty subscription ID".to_string(),
            });
        }
        Ok(id)
    }

    async fn delete_remote(&self, stream: &str, id: &str) -> Result<(), Error> {
        let credential = self.auth.credential()?;
        self.api
            .delete(&credential, id)
            .await
            .map_err(|e| Error::SubscriptionDeleteFailed {
                stream: stream.to_string(),
                reason: e.to_string(),
            })
    }
}
