//! Redis-backed cache. Values are stored without expiry.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use super::Cache;
use super::error::CacheResult;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let url = if url.is_empty() { DEFAULT_REDIS_URL } else { url };
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_raw(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_raw(&self, key: &str, value: String) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let () = conn.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _removed: usize = conn.del(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;

    #[tokio::test]
    async fn test_redis_set_get_delete() {
        let Ok(url) = std::env::var("TIDINGS_TEST_REDIS_URL") else {
            return;
        };
        let cache = RedisCache::connect(&url).await.unwrap();
        let key = format!("tidings-test-{}", uuid::Uuid::new_v4());

        cache.set(&key, &vec![1, 2, 3]).await.unwrap();
        let got: Option<Vec<i32>> = cache.get(&key).await.unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));

        cache.delete(&key).await.unwrap();
        let got: Option<Vec<i32>> = cache.get(&key).await.unwrap();
        assert!(got.is_none());
    }
}
