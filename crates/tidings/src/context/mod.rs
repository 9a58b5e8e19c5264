//! Per-conversation context windows.
//!
//! A window is the ordered list of prior prompt/reply pairs fed back to the
//! model. It lives in the cache under the conversation id and is rebuilt from
//! the conversation log when the cache holds fewer entries than requested.
//! Off-the-record messages never enter a window.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{Cache, CacheExt, CacheResult};
use crate::store::{ConversationStore, Message, StoreResult};

/// Default and maximum number of entries sent to the model.
pub const DEFAULT_CONTEXT: usize = 10;

/// One prior prompt and its reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub prompt: String,
    pub reply: String,
}

impl From<&Message> for ContextEntry {
    fn from(message: &Message) -> Self {
        Self {
            prompt: message.prompt.clone(),
            reply: message.reply.clone(),
        }
    }
}

/// Ordered context entries, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextWindow(Vec<ContextEntry>);

impl ContextWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.0
    }

    pub fn push(&mut self, entry: ContextEntry) {
        self.0.push(entry);
    }

    /// Drop the oldest entries until at most `max` remain.
    pub fn truncate_front(&mut self, max: usize) {
        if self.0.len() > max {
            let excess = self.0.len() - max;
            self.0.drain(..excess);
        }
    }
}

impl From<Vec<ContextEntry>> for ContextWindow {
    fn from(entries: Vec<ContextEntry>) -> Self {
        Self(entries)
    }
}

/// Clamp a requested window size.
///
/// Missing, negative or oversized requests all resolve to `ceiling`.
pub fn clamp_window(requested: Option<i64>, ceiling: usize) -> usize {
    match requested {
        Some(n) if n >= 0 && (n as u64) <= ceiling as u64 => n as usize,
        _ => ceiling,
    }
}

/// Reads, rebuilds and saves context windows.
#[derive(Clone)]
pub struct ContextManager {
    cache: Arc<dyn Cache>,
    store: Arc<dyn ConversationStore>,
}

impl ContextManager {
    pub fn new(cache: Arc<dyn Cache>, store: Arc<dyn ConversationStore>) -> Self {
        Self { cache, store }
    }

    /// Whatever is cached for the conversation, possibly empty.
    pub async fn get_cached(&self, conversation_id: &str) -> ContextWindow {
        match self.cache.get::<ContextWindow>(conversation_id).await {
            Ok(window) => window.unwrap_or_default(),
            Err(e) => {
                log::warn!("Ignoring unreadable context for {}: {}", conversation_id, e);
                ContextWindow::new()
            }
        }
    }

    /// Rebuild a window from the conversation log.
    ///
    /// Walks history newest first, skipping off-the-record messages, until
    /// `max` entries are collected or history runs out.
    pub async fn rebuild(&self, conversation_id: &str, max: usize) -> StoreResult<ContextWindow> {
        if max == 0 {
            return Ok(ContextWindow::new());
        }

        let mut newest_first = Vec::with_capacity(max);

        let mut offset = 0;
        loop {
            let page = self
                .store
                .recent_messages(conversation_id, max, offset)
                .await?;
            let exhausted = page.len() < max;
            offset += page.len();

            for message in page.iter().filter(|m| !m.otr) {
                newest_first.push(ContextEntry::from(message));
                if newest_first.len() == max {
                    break;
                }
            }

            if exhausted || newest_first.len() == max {
                break;
            }
        }

        newest_first.reverse();
        log::debug!(
            "Rebuilt {} context entries for {}",
            newest_first.len(),
            conversation_id
        );
        Ok(ContextWindow(newest_first))
    }

    /// Append the message to `prior` and replace the cached window.
    ///
    /// Off-the-record messages leave the cache untouched.
    pub async fn save(&self, message: &Message, prior: &ContextWindow) -> CacheResult<()> {
        if message.otr {
            return Ok(());
        }

        let mut window = prior.clone();
        window.push(ContextEntry::from(message));
        self.cache.set(&message.conversation_id, &window).await
    }

    /// The window to send with the next prompt.
    ///
    /// Falls back to the log when the cache is short, then keeps only the
    /// newest `max` entries.
    pub async fn resolve(&self, conversation_id: &str, max: usize) -> StoreResult<ContextWindow> {
        let mut window = self.get_cached(conversation_id).await;
        if window.len() < max {
            window = self.rebuild(conversation_id, max).await?;
        }
        window.truncate_front(max);
        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::store::{Conversation, MemoryStore};

    struct Fixture {
        cache: Arc<MemoryCache>,
        store: Arc<MemoryStore>,
        manager: ContextManager,
        conversation: Conversation,
    }

    async fn fixture() -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryStore::new());
        let manager = ContextManager::new(cache.clone(), store.clone());
        let conversation = Conversation::new("general", "gpt-3", "alice");
        store.create_conversation(&conversation).await.unwrap();
        Fixture {
            cache,
            store,
            manager,
            conversation,
        }
    }

    fn entry(prompt: &str) -> ContextEntry {
        ContextEntry {
            prompt: prompt.to_string(),
            reply: format!("re: {prompt}"),
        }
    }

    impl Fixture {
        async fn log(&self, prompt: &str, otr: bool) -> Message {
            let mut message = Message::new(&self.conversation, "alice", prompt, otr);
            message.reply = format!("re: {prompt}");
            self.store.create_message(&message).await.unwrap();
            message
        }
    }

    #[test]
    fn test_clamp_window() {
        assert_eq!(clamp_window(None, DEFAULT_CONTEXT), 10);
        assert_eq!(clamp_window(Some(3), DEFAULT_CONTEXT), 3);
        assert_eq!(clamp_window(Some(0), DEFAULT_CONTEXT), 0);
        assert_eq!(clamp_window(Some(10), DEFAULT_CONTEXT), 10);
        assert_eq!(clamp_window(Some(11), DEFAULT_CONTEXT), 10);
        assert_eq!(clamp_window(Some(-1), DEFAULT_CONTEXT), 10);
    }

    #[test]
    fn test_truncate_front_keeps_newest() {
        let mut window = ContextWindow::from(vec![entry("a"), entry("b"), entry("c")]);
        window.truncate_front(2);
        assert_eq!(window.entries(), &[entry("b"), entry("c")]);
        window.truncate_front(5);
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_skips_off_the_record() {
        let f = fixture().await;
        f.log("A", false).await;
        f.log("B", true).await;
        f.log("C", false).await;

        let window = f.manager.rebuild(&f.conversation.id, 5).await.unwrap();
        assert_eq!(window.entries(), &[entry("A"), entry("C")]);
    }

    #[tokio::test]
    async fn test_rebuild_returns_exactly_n_despite_interleaved_otr() {
        let f = fixture().await;
        for i in 0..6 {
            f.log(&format!("keep{i}"), false).await;
            f.log(&format!("otr{i}"), true).await;
        }

        let window = f.manager.rebuild(&f.conversation.id, 4).await.unwrap();
        let prompts: Vec<_> = window.entries().iter().map(|e| e.prompt.as_str()).collect();
        assert_eq!(prompts, ["keep2", "keep3", "keep4", "keep5"]);
    }

    #[tokio::test]
    async fn test_rebuild_with_zero_is_empty() {
        let f = fixture().await;
        f.log("A", false).await;
        assert!(f.manager.rebuild(&f.conversation.id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_off_the_record_leaves_cache_unchanged() {
        let f = fixture().await;
        let prior = ContextWindow::from(vec![entry("A")]);
        f.cache.set(&f.conversation.id, &prior).await.unwrap();

        let secret = Message::new(&f.conversation, "alice", "secret", true);
        f.manager.save(&secret, &ContextWindow::new()).await.unwrap();

        assert_eq!(f.manager.get_cached(&f.conversation.id).await, prior);
    }

    #[tokio::test]
    async fn test_save_replaces_cached_window() {
        let f = fixture().await;
        f.cache
            .set(&f.conversation.id, &ContextWindow::from(vec![entry("stale")]))
            .await
            .unwrap();

        let prior = ContextWindow::from(vec![entry("A")]);
        let mut message = Message::new(&f.conversation, "alice", "B", false);
        message.reply = "re: B".to_string();
        f.manager.save(&message, &prior).await.unwrap();

        let cached = f.manager.get_cached(&f.conversation.id).await;
        assert_eq!(cached.entries(), &[entry("A"), entry("B")]);
    }

    #[tokio::test]
    async fn test_resolve_rebuilds_short_cache_and_truncates() {
        let f = fixture().await;
        for p in ["A", "B", "C", "D"] {
            f.log(p, false).await;
        }
        f.cache
            .set(&f.conversation.id, &ContextWindow::from(vec![entry("D")]))
            .await
            .unwrap();

        let window = f.manager.resolve(&f.conversation.id, 3).await.unwrap();
        assert_eq!(window.entries(), &[entry("B"), entry("C"), entry("D")]);

        // A cache at least as long as requested is used as-is, trimmed from the front.
        let long = ContextWindow::from(vec![entry("w"), entry("x"), entry("y"), entry("z")]);
        f.cache.set(&f.conversation.id, &long).await.unwrap();
        let window = f.manager.resolve(&f.conversation.id, 2).await.unwrap();
        assert_eq!(window.entries(), &[entry("y"), entry("z")]);
    }

    #[tokio::test]
    async fn test_unreadable_cache_reads_as_empty() {
        let f = fixture().await;
        f.cache
            .set_raw(&f.conversation.id, "{broken".to_string())
            .await
            .unwrap();
        assert!(f.manager.get_cached(&f.conversation.id).await.is_empty());
    }
}
