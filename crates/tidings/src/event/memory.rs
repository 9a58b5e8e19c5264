//! In-process broker.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::RwLock;

use super::Broker;
use super::error::EventResult;
use super::subscriber::{Mailbox, Subscriber};

/// Single-node broker. Undelivered payloads do not survive a restart.
pub struct MemoryBroker {
    /// Topic -> registered mailboxes. Registration never keeps a mailbox alive.
    topics: RwLock<HashMap<String, Vec<Weak<Mailbox>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live registrations on a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|subs| subs.iter().filter(|s| s.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish_raw(&self, topic: &str, payload: String) -> EventResult<()> {
        let targets: Vec<Arc<Mailbox>> = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(subs) => subs.iter().filter_map(Weak::upgrade).collect(),
                None => return Ok(()),
            }
        };

        for mailbox in targets {
            if !mailbox.deliver(payload.clone()).await {
                debug!(
                    "Best-effort delivery to subscriber {} on topic {} not signalled",
                    mailbox.id, topic
                );
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> EventResult<Subscriber> {
        let subscriber = Subscriber::new(topic);

        let mut topics = self.topics.write().await;
        let subs = topics.entry(topic.to_string()).or_default();
        subs.retain(|s| s.strong_count() > 0);
        subs.push(Arc::downgrade(subscriber.mailbox()));

        info!("Subscriber {} registered on topic {}", subscriber.id(), topic);
        Ok(subscriber)
    }

    async fn unsubscribe(&self, subscriber: &Subscriber) -> EventResult<()> {
        let mut topics = self.topics.write().await;

        let Some(subs) = topics.get_mut(subscriber.topic()) else {
            return Ok(());
        };

        subs.retain(|s| match s.upgrade() {
            Some(mailbox) => mailbox.id != subscriber.id(),
            None => false,
        });
        if subs.is_empty() {
            topics.remove(subscriber.topic());
        }

        info!(
            "Subscriber {} removed from topic {}",
            subscriber.id(),
            subscriber.topic()
        );
        Ok(())
    }
}
