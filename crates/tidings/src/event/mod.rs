//! Topic-keyed publish/subscribe.
//!
//! A [`Broker`] fans serialized payloads out to every [`Subscriber`] currently
//! registered on a topic. Two implementations share the contract:
//! [`MemoryBroker`] for a single process and [`RedisBroker`] for cross-process
//! fan-out. Pick one at startup with [`connect_broker`].
//!
//! Delivery is at-most-once and best-effort. Each subscriber receives payloads
//! in the order publishes observed them; nothing is promised across
//! subscribers or topics.

mod error;
mod memory;
mod query;
mod redis;
mod subscriber;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

pub use error::{EventError, EventResult};
pub use memory::MemoryBroker;
pub use query::{DEFAULT_QUERY_TIMEOUT, Request, Response, query, respond};
pub use self::redis::RedisBroker;
pub use subscriber::Subscriber;

/// Topic-keyed fan-out of serialized payloads.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Queue `payload` on every subscriber of `topic`. No subscribers is not an error.
    async fn publish_raw(&self, topic: &str, payload: String) -> EventResult<()>;

    /// Register a fresh subscriber on `topic`.
    async fn subscribe(&self, topic: &str) -> EventResult<Subscriber>;

    /// Remove a subscriber from its topic. Safe to call more than once.
    async fn unsubscribe(&self, subscriber: &Subscriber) -> EventResult<()>;
}

/// Typed publishing for any broker.
#[async_trait]
pub trait BrokerExt: Broker {
    /// Serialize `payload` as JSON and publish it on `topic`.
    async fn publish<T>(&self, topic: &str, payload: &T) -> EventResult<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_string(payload)?;
        self.publish_raw(topic, payload).await
    }
}

impl<B: Broker + ?Sized> BrokerExt for B {}

/// Select a broker from a URL.
///
/// `redis://...` (or `rediss://...`) connects to Redis; anything else,
/// including an empty string, gives an in-process broker.
pub async fn connect_broker(url: &str) -> EventResult<Arc<dyn Broker>> {
    if url.starts_with("redis") {
        let broker = RedisBroker::connect(url).await?;
        log::info!("Using redis broker at {}", url);
        Ok(Arc::new(broker))
    } else {
        log::info!("Using in-process broker");
        Ok(Arc::new(MemoryBroker::new()))
    }
}
