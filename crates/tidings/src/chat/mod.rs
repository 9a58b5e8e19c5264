//! Prompt cycles.
//!
//! [`ChatService::prompt`] drives one prompt from context resolution to the
//! final published [`Envelope`]. Streaming replies are relayed by a spawned
//! task that waits for the initial record to be persisted before it touches
//! a single fragment.

mod error;

use std::sync::Arc;

use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::context::{ContextManager, ContextWindow, DEFAULT_CONTEXT, clamp_window};
use crate::event::{Broker, BrokerExt};
use crate::llm::{FragmentStream, ModelRegistry, user_token};
use crate::store::{Conversation, ConversationStore, Message, now};

pub use error::{ChatError, ChatResult};

/// Name given to conversations created without one.
pub const DEFAULT_CONVERSATION_NAME: &str = "general";

/// What subscribers of a conversation topic receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
    /// True while the reply is still streaming in.
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub conversation_id: String,
    pub user_id: String,
    pub prompt: String,
    /// Requested window size; clamped to the configured ceiling.
    #[serde(default)]
    pub context: Option<i64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub otr: bool,
}

/// Prompt cycle coordinator.
#[derive(Clone)]
pub struct ChatService {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ConversationStore>,
    contexts: ContextManager,
    models: Arc<ModelRegistry>,
    context_ceiling: usize,
}

impl ChatService {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ConversationStore>,
        contexts: ContextManager,
        models: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            broker,
            store,
            contexts,
            models,
            context_ceiling: DEFAULT_CONTEXT,
        }
    }

    /// Override the largest window a prompt may request.
    pub fn with_context_ceiling(mut self, ceiling: usize) -> Self {
        self.context_ceiling = ceiling;
        self
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Create a conversation bound to `model`, or to the default model when
    /// `model` is empty or unsupported.
    pub async fn create_conversation(
        &self,
        name: Option<&str>,
        model: Option<&str>,
        user_id: &str,
    ) -> ChatResult<Conversation> {
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_CONVERSATION_NAME);

        let default = self.models.default_name();
        let model = match model.filter(|m| !m.is_empty()) {
            Some(m) if self.models.supports(m) => m,
            Some(m) => {
                warn!("Unknown model {} defaulting to {}", m, default);
                default
            }
            None => default,
        };

        let conversation = Conversation::new(name, model, user_id);
        self.store.create_conversation(&conversation).await?;
        info!(
            "Created conversation {} ({}) for {}",
            conversation.id, conversation.model, user_id
        );
        Ok(conversation)
    }

    /// Run one prompt cycle and return the persisted message.
    ///
    /// For streaming requests the returned reply is empty; the reply arrives
    /// on the conversation topic as partial envelopes followed by exactly one
    /// final envelope. Otherwise a single final envelope is published before
    /// this returns.
    pub async fn prompt(&self, request: PromptRequest) -> ChatResult<Message> {
        let conversation = self.store.get_conversation(&request.conversation_id).await?;
        let window_size = clamp_window(request.context, self.context_ceiling);
        let user = user_token(&request.user_id, &conversation.id);

        let mut message = Message::new(
            &conversation,
            &request.user_id,
            &request.prompt,
            request.otr,
        );

        let mut window = ContextWindow::new();
        let mut relay = None;

        // Off-the-record prompts never reach the model.
        if !request.otr {
            window = self.contexts.resolve(&conversation.id, window_size).await?;
            let model = self.models.resolve(&conversation.model)?;
            debug!(
                "Prompting {} for conversation {} with {} context entries",
                model.name(),
                conversation.id,
                window.len()
            );

            if request.stream {
                let fragments = model.stream(&request.prompt, &user, &window).await?;
                let (ready_tx, ready_rx) = oneshot::channel();
                let service = self.clone();
                let prior = window.clone();
                tokio::spawn(async move {
                    service.relay_fragments(fragments, ready_rx, prior).await;
                });
                relay = Some(ready_tx);
            } else {
                message.reply = model.complete(&request.prompt, &user, &window).await?;
            }
        }

        if let Err(e) = self.store.touch_conversation(&conversation.id).await {
            warn!("Failed to touch conversation {}: {}", conversation.id, e);
        }

        // A failure here drops the rendezvous sender and the relay exits.
        self.store.create_message(&message).await?;

        match relay {
            Some(ready_tx) => {
                self.publish(&message, true).await;
                if ready_tx.send(message.clone()).is_err() {
                    warn!("Relay for message {} exited before start", message.id);
                }
            }
            None => {
                if let Err(e) = self.contexts.save(&message, &window).await {
                    warn!("Failed to save context for {}: {}", conversation.id, e);
                }
                self.publish(&message, false).await;
            }
        }

        Ok(message)
    }

    /// Accumulate streamed fragments, publishing the running reply, then
    /// persist and publish the final record.
    ///
    /// A stream that breaks off early is treated as complete: whatever text
    /// arrived becomes the final reply. If the final store write fails, the
    /// cycle ends there and watchers see no final envelope.
    async fn relay_fragments(
        &self,
        mut fragments: FragmentStream,
        ready: oneshot::Receiver<Message>,
        prior: ContextWindow,
    ) {
        let mut message = match ready.await {
            Ok(message) => message,
            Err(_) => {
                debug!("Prompt cycle aborted before the message was persisted");
                return;
            }
        };

        let mut reply = String::new();
        while let Some(fragment) = fragments.next().await {
            reply.push_str(&fragment);
            message.reply.clone_from(&reply);
            self.publish(&message, true).await;
        }

        message.reply = reply;
        message.updated_at = now();

        if let Err(e) = self.store.update_message(&message).await {
            error!("Failed to persist reply for message {}: {}", message.id, e);
            return;
        }

        if let Err(e) = self.contexts.save(&message, &prior).await {
            warn!(
                "Failed to save context for {}: {}",
                message.conversation_id, e
            );
        }

        self.publish(&message, false).await;
        debug!(
            "Streamed {} chars for message {}",
            message.reply.len(),
            message.id
        );
    }

    async fn publish(&self, message: &Message, partial: bool) {
        let envelope = Envelope {
            message: message.clone(),
            partial,
        };
        if let Err(e) = self
            .broker
            .publish(&message.conversation_id, &envelope)
            .await
        {
            warn!(
                "Failed to publish on {}: {}",
                message.conversation_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::event::{MemoryBroker, Subscriber};
    use crate::llm::{CompletionModel, MockModel};
    use crate::store::{MemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        service: ChatService,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ConversationStore>,
        contexts: ContextManager,
        model: Arc<MockModel>,
        conversation: Conversation,
    }

    async fn harness_with(model: MockModel, store: Arc<dyn ConversationStore>) -> Harness {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let contexts = ContextManager::new(Arc::new(MemoryCache::new()), store.clone());
        let model = Arc::new(model);

        let mut registry = ModelRegistry::new("gpt-3");
        registry.register("gpt-3", model.clone());

        let service = ChatService::new(
            broker.clone(),
            store.clone(),
            contexts.clone(),
            Arc::new(registry),
        );
        let conversation = service
            .create_conversation(Some("general"), Some("gpt-3"), "alice")
            .await
            .unwrap();

        Harness {
            service,
            broker,
            store,
            contexts,
            model,
            conversation,
        }
    }

    async fn harness(model: MockModel) -> Harness {
        harness_with(model, Arc::new(MemoryStore::new())).await
    }

    impl Harness {
        fn request(&self, prompt: &str, stream: bool, otr: bool) -> PromptRequest {
            PromptRequest {
                conversation_id: self.conversation.id.clone(),
                user_id: "alice".to_string(),
                prompt: prompt.to_string(),
                context: None,
                stream,
                otr,
            }
        }

        async fn subscribe(&self) -> Subscriber {
            self.broker.subscribe(&self.conversation.id).await.unwrap()
        }
    }

    /// Envelopes up to and including the first final one.
    async fn collect_cycle(sub: &Subscriber) -> Vec<Envelope> {
        let cancel = CancellationToken::new();
        let collect = async {
            let mut envelopes = Vec::new();
            loop {
                let Some(envelope) = sub.next::<Envelope>(&cancel).await.unwrap() else {
                    continue;
                };
                let done = !envelope.partial;
                envelopes.push(envelope);
                if done {
                    return envelopes;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), collect)
            .await
            .expect("prompt cycle did not finish")
    }

    #[tokio::test]
    async fn test_streaming_cycle_publishes_one_final_envelope() {
        let h = harness(MockModel::new("gpt-3.5-turbo", ["Hel", "lo", " world"])).await;
        let sub = h.subscribe().await;

        let message = h.service.prompt(h.request("greet me", true, false)).await.unwrap();
        assert_eq!(message.reply, "");

        let envelopes = collect_cycle(&sub).await;
        let finals: Vec<_> = envelopes.iter().filter(|e| !e.partial).collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].message.reply, "Hello world");
        assert_eq!(finals[0].message.id, message.id);

        // Initial record, then one cumulative partial per fragment.
        let partials: Vec<_> = envelopes
            .iter()
            .filter(|e| e.partial)
            .map(|e| e.message.reply.as_str())
            .collect();
        assert_eq!(partials, ["", "Hel", "Hello", "Hello world"]);

        let stored = h.store.get_message(&message.id).await.unwrap();
        assert_eq!(stored.reply, "Hello world");

        let cached = h.contexts.get_cached(&h.conversation.id).await;
        assert_eq!(cached.len(), 1);
        assert_eq!(cached.entries()[0].reply, "Hello world");
    }

    #[tokio::test]
    async fn test_inline_cycle_publishes_before_returning() {
        let h = harness(MockModel::new("gpt-3.5-turbo", ["four"])).await;
        let sub = h.subscribe().await;

        let message = h.service.prompt(h.request("2+2?", false, false)).await.unwrap();
        assert_eq!(message.reply, "four");
        assert_eq!(sub.pending().await, 1);

        let envelopes = collect_cycle(&sub).await;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].message, message);

        let cached = h.contexts.get_cached(&h.conversation.id).await;
        assert_eq!(cached.entries()[0].prompt, "2+2?");
    }

    #[tokio::test]
    async fn test_context_feeds_next_prompt() {
        let h = harness(MockModel::new("gpt-3.5-turbo", ["ok"])).await;
        h.service.prompt(h.request("first", false, false)).await.unwrap();
        h.service.prompt(h.request("second", false, false)).await.unwrap();

        let calls = h.model.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].context.is_empty());
        assert_eq!(calls[1].context.entries()[0].prompt, "first");
        assert_eq!(calls[1].user, crate::llm::user_token("alice", &h.conversation.id));
    }

    #[tokio::test]
    async fn test_requested_window_is_honoured() {
        let h = harness(MockModel::new("gpt-3.5-turbo", ["ok"])).await;
        for i in 0..4 {
            h.service
                .prompt(h.request(&format!("p{i}"), false, false))
                .await
                .unwrap();
        }

        let mut request = h.request("last", false, false);
        request.context = Some(2);
        h.service.prompt(request).await.unwrap();

        let calls = h.model.calls();
        let prompts: Vec<_> = calls[4]
            .context
            .entries()
            .iter()
            .map(|e| e.prompt.as_str())
            .collect();
        assert_eq!(prompts, ["p2", "p3"]);
    }

    #[tokio::test]
    async fn test_off_the_record_skips_model_and_cache() {
        let h = harness(MockModel::new("gpt-3.5-turbo", ["nope"])).await;
        h.service.prompt(h.request("on record", false, false)).await.unwrap();
        let before = h.contexts.get_cached(&h.conversation.id).await;

        let sub = h.subscribe().await;
        let message = h.service.prompt(h.request("secret", true, true)).await.unwrap();
        assert!(message.otr);
        assert_eq!(message.reply, "");
        assert_eq!(h.model.calls().len(), 1);

        let envelopes = collect_cycle(&sub).await;
        assert_eq!(envelopes.len(), 1);
        assert!(!envelopes[0].partial);

        assert_eq!(h.contexts.get_cached(&h.conversation.id).await, before);
        assert!(h.store.get_message(&message.id).await.unwrap().otr);
    }

    #[tokio::test]
    async fn test_interrupted_stream_finalises_partial_reply() {
        let h = harness(MockModel::cut_off("gpt-3.5-turbo", ["Hel", "lo"])).await;
        let sub = h.subscribe().await;

        let message = h.service.prompt(h.request("greet me", true, false)).await.unwrap();

        let envelopes = collect_cycle(&sub).await;
        let finals: Vec<_> = envelopes.iter().filter(|e| !e.partial).collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].message.reply, "Hello");
        assert_eq!(envelopes.last().unwrap().message.reply, "Hello");

        let stored = h.store.get_message(&message.id).await.unwrap();
        assert_eq!(stored.reply, "Hello");

        // Nothing follows the final envelope.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sub.pending().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_not_found() {
        let h = harness(MockModel::new("gpt-3.5-turbo", ["x"])).await;
        let mut request = h.request("hi", false, false);
        request.conversation_id = "missing".to_string();

        match h.service.prompt(request).await {
            Err(ChatError::Store(e)) => assert!(e.is_not_found()),
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_model_is_upstream_error() {
        let h = harness(MockModel::failing("gpt-3.5-turbo")).await;
        let result = h.service.prompt(h.request("hi", true, false)).await;
        assert!(matches!(result, Err(ChatError::Upstream(_))));
        assert!(h.store.list_messages(&h.conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_model_falls_back_to_default() {
        let h = harness(MockModel::new("gpt-3.5-turbo", ["x"])).await;
        let conversation = h
            .service
            .create_conversation(None, Some("llama"), "bob")
            .await
            .unwrap();
        assert_eq!(conversation.name, DEFAULT_CONVERSATION_NAME);
        assert_eq!(conversation.model, "gpt-3");
    }

    /// Accepts everything except new messages.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl ConversationStore for ReadOnlyStore {
        async fn create_conversation(&self, c: &Conversation) -> StoreResult<()> {
            self.0.create_conversation(c).await
        }
        async fn get_conversation(&self, id: &str) -> StoreResult<Conversation> {
            self.0.get_conversation(id).await
        }
        async fn touch_conversation(&self, id: &str) -> StoreResult<()> {
            self.0.touch_conversation(id).await
        }
        async fn create_message(&self, _message: &Message) -> StoreResult<()> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }
        async fn get_message(&self, id: &str) -> StoreResult<Message> {
            self.0.get_message(id).await
        }
        async fn update_message(&self, message: &Message) -> StoreResult<()> {
            self.0.update_message(message).await
        }
        async fn list_messages(&self, id: &str) -> StoreResult<Vec<Message>> {
            self.0.list_messages(id).await
        }
        async fn recent_messages(
            &self,
            id: &str,
            limit: usize,
            offset: usize,
        ) -> StoreResult<Vec<Message>> {
            self.0.recent_messages(id, limit, offset).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_surfaced_and_nothing_published() {
        let store: Arc<dyn ConversationStore> = Arc::new(ReadOnlyStore(MemoryStore::new()));
        let h = harness_with(MockModel::new("gpt-3.5-turbo", ["a", "b"]), store).await;
        let sub = h.subscribe().await;

        let result = h.service.prompt(h.request("hi", true, false)).await;
        assert!(matches!(
            result,
            Err(ChatError::Store(StoreError::Database(_)))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sub.pending().await, 0);
    }

    /// Accepts everything except reply updates.
    struct FrozenRepliesStore(MemoryStore);

    #[async_trait]
    impl ConversationStore for FrozenRepliesStore {
        async fn create_conversation(&self, c: &Conversation) -> StoreResult<()> {
            self.0.create_conversation(c).await
        }
        async fn get_conversation(&self, id: &str) -> StoreResult<Conversation> {
            self.0.get_conversation(id).await
        }
        async fn touch_conversation(&self, id: &str) -> StoreResult<()> {
            self.0.touch_conversation(id).await
        }
        async fn create_message(&self, message: &Message) -> StoreResult<()> {
            self.0.create_message(message).await
        }
        async fn get_message(&self, id: &str) -> StoreResult<Message> {
            self.0.get_message(id).await
        }
        async fn update_message(&self, _message: &Message) -> StoreResult<()> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }
        async fn list_messages(&self, id: &str) -> StoreResult<Vec<Message>> {
            self.0.list_messages(id).await
        }
        async fn recent_messages(
            &self,
            id: &str,
            limit: usize,
            offset: usize,
        ) -> StoreResult<Vec<Message>> {
            self.0.recent_messages(id, limit, offset).await
        }
    }

    #[tokio::test]
    async fn test_failed_reply_update_publishes_no_final_envelope() {
        let store: Arc<dyn ConversationStore> = Arc::new(FrozenRepliesStore(MemoryStore::new()));
        let h = harness_with(MockModel::new("gpt-3.5-turbo", ["a", "b"]), store).await;
        let sub = h.subscribe().await;

        let message = h.service.prompt(h.request("hi", true, false)).await.unwrap();

        let cancel = CancellationToken::new();
        let mut partials = Vec::new();
        while partials.len() < 3 {
            let next = tokio::time::timeout(Duration::from_secs(2), sub.next::<Envelope>(&cancel))
                .await
                .expect("partials did not arrive")
                .unwrap();
            if let Some(envelope) = next {
                assert!(envelope.partial);
                partials.push(envelope.message.reply);
            }
        }
        assert_eq!(partials, ["", "a", "ab"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sub.pending().await, 0);

        // The stored record keeps the initial empty reply and no context is cached.
        assert_eq!(h.store.get_message(&message.id).await.unwrap().reply, "");
        assert!(h.contexts.get_cached(&h.conversation.id).await.is_empty());
    }
}
