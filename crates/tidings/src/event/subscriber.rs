//! Per-registration mailbox drained by a single consumer.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{EventError, EventResult};

/// Capacity of the wake channel paired with each subscriber queue.
pub(crate) const DELIVERY_BUFFER: usize = 100;

/// State shared between a [`Subscriber`] and the broker that feeds it.
///
/// Brokers only ever hold this through a `Weak` (memory) or a reader task
/// (redis); neither controls the subscriber's lifecycle.
pub(crate) struct Mailbox {
    pub(crate) id: String,
    pub(crate) topic: String,
    queue: Mutex<VecDeque<String>>,
    wake: mpsc::Sender<()>,
    pub(crate) exit: CancellationToken,
}

impl Mailbox {
    /// Append a payload and try to signal the consumer without blocking.
    ///
    /// Returns false when the wake signal was dropped. The payload stays queued
    /// either way and is picked up by the consumer's next receive.
    pub(crate) async fn deliver(&self, payload: String) -> bool {
        if self.exit.is_cancelled() {
            return false;
        }

        self.queue.lock().await.push_back(payload);

        match self.wake.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!(
                    "Delivery channel full for subscriber {} on topic {}, payload left queued",
                    self.id, self.topic
                );
                false
            }
            Err(TrySendError::Closed(())) => false,
        }
    }

    async fn pop(&self) -> Option<String> {
        self.queue.lock().await.pop_front()
    }

    async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

/// A registered, ordered mailbox for one consumer of one topic.
///
/// Payloads are delivered FIFO. Dropping the subscriber closes it.
pub struct Subscriber {
    mailbox: Arc<Mailbox>,
    wake_rx: Mutex<mpsc::Receiver<()>>,
}

impl Subscriber {
    pub(crate) fn new(topic: &str) -> Self {
        let (wake, wake_rx) = mpsc::channel(DELIVERY_BUFFER);
        Self {
            mailbox: Arc::new(Mailbox {
                id: Uuid::new_v4().to_string(),
                topic: topic.to_string(),
                queue: Mutex::new(VecDeque::new()),
                wake,
                exit: CancellationToken::new(),
            }),
            wake_rx: Mutex::new(wake_rx),
        }
    }

    pub(crate) fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Unique identifier of this registration.
    pub fn id(&self) -> &str {
        &self.mailbox.id
    }

    /// Topic this subscriber is bound to.
    pub fn topic(&self) -> &str {
        &self.mailbox.topic
    }

    /// Signal that fires once the subscriber is closed.
    pub fn exit_signal(&self) -> &CancellationToken {
        &self.mailbox.exit
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.exit.is_cancelled()
    }

    /// Number of payloads queued but not yet received.
    pub async fn pending(&self) -> usize {
        self.mailbox.len().await
    }

    /// Wait for the next serialized payload.
    ///
    /// Returns `Ok(None)` on a spurious wake (the queue was drained by a
    /// concurrent receiver); callers are expected to loop. Closure and
    /// cancellation both yield [`EventError::EndOfStream`].
    pub async fn next_raw(&self, cancel: &CancellationToken) -> EventResult<Option<String>> {
        let exit = &self.mailbox.exit;
        if exit.is_cancelled() || cancel.is_cancelled() {
            return Err(EventError::EndOfStream);
        }

        let mut wake_rx = tokio::select! {
            biased;
            _ = exit.cancelled() => return Err(EventError::EndOfStream),
            _ = cancel.cancelled() => return Err(EventError::EndOfStream),
            rx = self.wake_rx.lock() => rx,
        };

        // A payload whose wake signal was dropped is still at the head.
        if let Some(payload) = self.mailbox.pop().await {
            let _ = wake_rx.try_recv();
            return Ok(Some(payload));
        }

        tokio::select! {
            biased;
            _ = exit.cancelled() => Err(EventError::EndOfStream),
            _ = cancel.cancelled() => Err(EventError::EndOfStream),
            signal = wake_rx.recv() => match signal {
                Some(()) => Ok(self.mailbox.pop().await),
                None => Err(EventError::EndOfStream),
            },
        }
    }

    /// Wait for the next payload and decode it into `T`.
    pub async fn next<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
    ) -> EventResult<Option<T>> {
        match self.next_raw(cancel).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Close the subscriber. Safe to call any number of times.
    pub fn close(&self) {
        if !self.mailbox.exit.is_cancelled() {
            debug!(
                "Closing subscriber {} on topic {}",
                self.mailbox.id, self.mailbox.topic
            );
        }
        self.mailbox.exit.cancel();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.mailbox.exit.cancel();
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.mailbox.id)
            .field("topic", &self.mailbox.topic)
            .field("closed", &self.is_closed())
            .finish()
    }
}
