//! In-process store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::ConversationStore;
use super::error::{StoreError, StoreResult};
use super::models::{Conversation, Message, now};

#[derive(Default)]
pub struct MemoryStore {
    conversations: RwLock<HashMap<String, Conversation>>,
    /// Insertion order is the log order.
    messages: RwLock<Vec<Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Conversation> {
        self.conversations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::conversation(id))
    }

    async fn touch_conversation(&self, id: &str) -> StoreResult<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::conversation(id))?;
        conversation.updated_at = now();
        Ok(())
    }

    async fn create_message(&self, message: &Message) -> StoreResult<()> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> StoreResult<Message> {
        self.messages
            .read()
            .await
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| StoreError::message(id))
    }

    async fn update_message(&self, message: &Message) -> StoreResult<()> {
        let mut messages = self.messages.write().await;
        let stored = messages
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| StoreError::message(&message.id))?;
        stored.reply = message.reply.clone();
        stored.updated_at = message.updated_at.clone();
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .rev()
            .filter(|m| m.conversation_id == conversation_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
