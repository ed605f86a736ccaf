// =============================================================================
// LAYOUT CACHE
// =============================================================================
// Coach layouts cached under `layout:{schedule}:{CLASS}`.
//
// The allocator reads entries without locking, but writes and deletes them
// only while it holds the schedule's lock: a layout is stored under the same
// lock it was computed under, and every commit deletes the entry before the
// lock is released.
//
// Cache failures are logged and otherwise ignored; the engine is always the
// source of truth.
// =============================================================================

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::CoachLayoutResponse;

pub fn layout_cache_key(schedule_id: Uuid, train_class: &str) -> String {
    format!("layout:{}:{}", schedule_id, train_class.trim().to_ascii_uppercase())
}

#[async_trait]
pub trait LayoutCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CoachLayoutResponse>;

    async fn put(&self, key: &str, layout: &CoachLayoutResponse);

    async fn invalidate(&self, key: &str);
}

// -----------------------------------------------------------------------------
// REDIS
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct RedisLayoutCache {
    redis: redis::aio::ConnectionManager,
    ttl_secs: u64,
}

impl RedisLayoutCache {
    pub fn new(redis: redis::aio::ConnectionManager, ttl_secs: u64) -> Self {
        Self { redis, ttl_secs }
    }

    async fn fetch(&self, key: &str) -> AppResult<Option<CoachLayoutResponse>> {
        let cached: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.redis.clone())
            .await?;
        // An undecodable entry counts as a miss and gets overwritten.
        Ok(cached.and_then(|json| serde_json::from_str(&json).ok()))
    }

    async fn store(&self, key: &str, layout: &CoachLayoutResponse) -> AppResult<()> {
        let json = serde_json::to_string(layout)
            .map_err(|e| AppError::Internal(format!("encode layout: {}", e)))?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(self.ttl_secs)
            .arg(json)
            .query_async::<_, ()>(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut self.redis.clone())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LayoutCache for RedisLayoutCache {
    async fn get(&self, key: &str) -> Option<CoachLayoutResponse> {
        match self.fetch(key).await {
            Ok(layout) => layout,
            Err(e) => {
                tracing::warn!(key, error = %e, "Layout cache read failed");
                None
            }
        }
    }

    async fn put(&self, key: &str, layout: &CoachLayoutResponse) {
        if let Err(e) = self.store(key, layout).await {
            tracing::warn!(key, error = %e, "Layout cache write failed");
        }
    }

    async fn invalidate(&self, key: &str) {
        if let Err(e) = self.delete(key).await {
            tracing::error!(key, error = %e, "Failed to invalidate layout cache");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_cache_key_normalises_class() {
        let id = Uuid::nil();
        assert_eq!(layout_cache_key(id, " 3a"), format!("layout:{}:3A", id));
    }
}
