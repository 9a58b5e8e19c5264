//! Redis pub/sub broker for cross-process fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::Broker;
use super::error::EventResult;
use super::subscriber::{Mailbox, Subscriber};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Broker backed by Redis `PUBLISH`/`SUBSCRIBE`.
///
/// Publishes share one multiplexed connection. Every subscriber gets its own
/// pub/sub connection and a reader task that feeds its mailbox until the
/// subscriber is unsubscribed or closed.
pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    /// Subscriber id -> stop signal of its reader task.
    readers: Mutex<HashMap<String, CancellationToken>>,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> EventResult<Self> {
        let url = if url.is_empty() { DEFAULT_REDIS_URL } else { url };
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn,
            readers: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish_raw(&self, topic: &str, payload: String) -> EventResult<()> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(topic, payload).await?;
        debug!("Published on {} to {} redis subscribers", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> EventResult<Subscriber> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let subscriber = Subscriber::new(topic);
        let mailbox = Arc::clone(subscriber.mailbox());

        // Fires on unsubscribe, and on close through the parent exit signal.
        let stop = mailbox.exit.child_token();
        {
            let mut readers = self.readers.lock().await;
            readers.retain(|_, token| !token.is_cancelled());
            readers.insert(subscriber.id().to_string(), stop.clone());
        }
        tokio::spawn(read_loop(pubsub, mailbox, stop));

        info!("Subscriber {} registered on redis topic {}", subscriber.id(), topic);
        Ok(subscriber)
    }

    async fn unsubscribe(&self, subscriber: &Subscriber) -> EventResult<()> {
        // Stopping the reader releases the redis side. Payloads already
        // queued stay readable.
        if let Some(stop) = self.readers.lock().await.remove(subscriber.id()) {
            stop.cancel();
            info!(
                "Subscriber {} removed from redis topic {}",
                subscriber.id(),
                subscriber.topic()
            );
        }
        Ok(())
    }
}

async fn read_loop(
    mut pubsub: redis::aio::PubSub,
    mailbox: Arc<Mailbox>,
    stop: CancellationToken,
) {
    {
        let messages = pubsub.on_message();
        tokio::pin!(messages);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                msg = messages.next() => match msg {
                    Some(msg) => match msg.get_payload::<String>() {
                        Ok(payload) => {
                            mailbox.deliver(payload).await;
                        }
                        Err(e) => warn!(
                            "Dropping undecodable payload on topic {}: {}",
                            mailbox.topic, e
                        ),
                    },
                    None => {
                        warn!("Redis pub/sub stream for topic {} ended", mailbox.topic);
                        mailbox.exit.cancel();
                        break;
                    }
                },
            }
        }
    }

    if let Err(e) = pubsub.unsubscribe(&mailbox.topic).await {
        debug!("Redis unsubscribe from {} failed: {}", mailbox.topic, e);
    }
    debug!("Reader for subscriber {} exited", mailbox.id);
}
