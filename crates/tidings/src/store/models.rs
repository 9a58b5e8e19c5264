//! Conversation data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Current time as an RFC 3339 string.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A conversation. Its id doubles as the broker topic for its live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub id: String,
    /// Name given by the user.
    pub name: String,
    /// Model the conversation is bound to.
    pub model: String,
    /// Owner.
    pub user_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub fn new(name: impl Into<String>, model: impl Into<String>, user_id: impl Into<String>) -> Self {
        let ts = now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            model: model.into(),
            user_id: user_id.into(),
            created_at: ts.clone(),
            updated_at: ts,
        }
    }
}

/// One prompt/reply cycle.
///
/// Created once per prompt. While a reply streams in only `reply` and
/// `updated_at` change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub prompt: String,
    pub reply: String,
    /// Model that produced the reply.
    pub model: String,
    /// Off the record: never fed back to the model as context.
    pub otr: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Message {
    pub fn new(conversation: &Conversation, user_id: &str, prompt: &str, otr: bool) -> Self {
        let ts = now();
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            user_id: user_id.to_string(),
            prompt: prompt.to_string(),
            reply: String::new(),
            model: conversation.model.clone(),
            otr,
            created_at: ts.clone(),
            updated_at: ts,
        }
    }
}
