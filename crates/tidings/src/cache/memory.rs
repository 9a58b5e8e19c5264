//! In-process cache.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Cache;
use super::error::CacheResult;

#[derive(Default)]
pub struct MemoryCache {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_raw(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: String) -> CacheResult<()> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, CacheExt};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        prompt: String,
        reply: String,
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let cache = MemoryCache::new();
        let got: Option<Entry> = cache.get("absent").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_set_overwrites_and_delete_removes() {
        let cache = MemoryCache::new();
        let first = vec![Entry {
            prompt: "hi".into(),
            reply: "hello".into(),
        }];
        cache.set("conv", &first).await.unwrap();

        let second: Vec<Entry> = Vec::new();
        cache.set("conv", &second).await.unwrap();
        let got: Option<Vec<Entry>> = cache.get("conv").await.unwrap();
        assert_eq!(got, Some(Vec::new()));

        cache.delete("conv").await.unwrap();
        cache.delete("conv").await.unwrap();
        assert!(cache.get_raw("conv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_value_is_error() {
        let cache = MemoryCache::new();
        cache.set_raw("conv", "not json".to_string()).await.unwrap();
        let result = cache.get::<Vec<Entry>>("conv").await;
        assert!(matches!(result, Err(CacheError::Codec(_))));
    }
}
