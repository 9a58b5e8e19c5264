//! Key/value cache holding JSON documents.
//!
//! Used for per-conversation context windows. A missing key reads as `None`;
//! a value that no longer decodes is an error.

mod error;
mod memory;
mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use error::{CacheError, CacheResult};
pub use memory::MemoryCache;
pub use self::redis::RedisCache;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_raw(&self, key: &str) -> CacheResult<Option<String>>;
    async fn set_raw(&self, key: &str, value: String) -> CacheResult<()>;
    async fn delete(&self, key: &str) -> CacheResult<()>;
}

/// Typed access for any cache.
#[async_trait]
pub trait CacheExt: Cache {
    async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set<T>(&self, key: &str, value: &T) -> CacheResult<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, raw).await
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// `redis://...` gives a Redis cache, anything else an in-process one.
pub async fn connect_cache(url: &str) -> CacheResult<Arc<dyn Cache>> {
    if url.starts_with("redis") {
        let cache = RedisCache::connect(url).await?;
        log::info!("Using redis cache at {}", url);
        Ok(Arc::new(cache))
    } else {
        log::info!("Using in-process cache");
        Ok(Arc::new(MemoryCache::new()))
    }
}
