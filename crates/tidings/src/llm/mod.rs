//! Language-model completion engines.
//!
//! A [`CompletionModel`] answers a prompt either in one piece or as a stream
//! of text fragments. [`ModelRegistry`] maps the model names conversations are
//! bound to onto engines.

mod error;
mod mock;
mod openai;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::context::ContextWindow;

pub use error::{LlmError, LlmResult};
pub use mock::{MockCall, MockModel};
pub use openai::{DEFAULT_URL, OpenAiClient, OpenAiModel};

/// Character allowance for one completion request, prompt included.
pub const DEFAULT_LIMIT: usize = 4096;

/// Model used when a conversation names none, or one that is not supported.
pub const DEFAULT_MODEL: &str = "gpt-3";

/// Reply fragments in arrival order. The stream ending is the close signal.
pub type FragmentStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Upstream model identifier.
    fn name(&self) -> &str;

    /// Complete `prompt` in one call.
    async fn complete(
        &self,
        prompt: &str,
        user: &str,
        context: &ContextWindow,
    ) -> LlmResult<String>;

    /// Complete `prompt` as a stream of fragments.
    ///
    /// Setup failures are returned; failures after the first fragment are
    /// logged and end the stream.
    async fn stream(
        &self,
        prompt: &str,
        user: &str,
        context: &ContextWindow,
    ) -> LlmResult<FragmentStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    fn new(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
        }
    }
}

/// Assemble the request messages for `prompt`.
///
/// Context entries are added oldest first while they fit in `limit` minus
/// the prompt length; the first entry that does not fit ends assembly. The
/// prompt itself is always last.
pub fn build_messages(prompt: &str, context: &ContextWindow, limit: usize) -> Vec<ChatMessage> {
    let mut budget = limit as i64 - prompt.len() as i64;
    let mut messages = Vec::with_capacity(context.len() * 2 + 1);

    for entry in context.entries() {
        budget -= (entry.prompt.len() + entry.reply.len()) as i64;
        if budget < 0 {
            break;
        }
        messages.push(ChatMessage::new(Role::User, &entry.prompt));
        messages.push(ChatMessage::new(Role::Assistant, &entry.reply));
    }

    messages.push(ChatMessage::new(Role::User, prompt));
    messages
}

/// Opaque per-user, per-conversation identifier passed upstream.
pub fn user_token(user_id: &str, conversation_id: &str) -> String {
    STANDARD.encode(format!("{user_id}-{conversation_id}"))
}

/// Model name to engine.
#[derive(Clone)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn CompletionModel>>,
    default: String,
}

impl ModelRegistry {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            models: HashMap::new(),
            default: default.into(),
        }
    }

    /// The stock OpenAI aliases, each allowed `limit` characters per request.
    pub fn openai(client: OpenAiClient, default: impl Into<String>, limit: usize) -> Self {
        let mut registry = Self::new(default);
        for (alias, model) in [("gpt-4", "gpt-4"), ("gpt-3", "gpt-3.5-turbo")] {
            let model = OpenAiModel::new(client.clone(), model).with_limit(limit);
            registry.register(alias, Arc::new(model));
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, model: Arc<dyn CompletionModel>) {
        self.models.insert(name.into(), model);
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn supports(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Supported names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Engine for `name`, or the default engine when `name` is unsupported.
    pub fn resolve(&self, name: &str) -> LlmResult<Arc<dyn CompletionModel>> {
        if let Some(model) = self.models.get(name) {
            return Ok(model.clone());
        }

        log::warn!("Unsupported model {} defaulting to {}", name, self.default);
        self.models
            .get(&self.default)
            .cloned()
            .ok_or_else(|| LlmError::UnsupportedModel(self.default.clone()))
    }
}
