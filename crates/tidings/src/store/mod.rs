//! Durable conversation log.
//!
//! [`SqliteStore`] is the production backend; [`MemoryStore`] keeps the same
//! semantics in process for tests and throwaway runs.

mod error;
mod memory;
mod models;
mod sqlite;

use async_trait::async_trait;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use models::{Conversation, Message, now};
pub use sqlite::SqliteStore;

/// Create/read/update/query-by-conversation access to persisted records.
///
/// Lookups of unknown ids fail with [`StoreError::NotFound`].
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, conversation: &Conversation) -> StoreResult<()>;

    async fn get_conversation(&self, id: &str) -> StoreResult<Conversation>;

    /// Bump `updated_at` on a conversation.
    async fn touch_conversation(&self, id: &str) -> StoreResult<()>;

    async fn create_message(&self, message: &Message) -> StoreResult<()>;

    async fn get_message(&self, id: &str) -> StoreResult<Message>;

    /// Overwrite the reply of an existing message.
    async fn update_message(&self, message: &Message) -> StoreResult<()>;

    /// All messages of a conversation, oldest first.
    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>>;

    /// A page of messages, newest first.
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>>;
}
