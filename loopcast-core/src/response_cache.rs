//! Redis-backed response cache for feed composition.
//!
//! Deliberately always fails open: if Redis is unreachable, reads behave
//! as a cache miss and writes are dropped, both logged at `warn`. This is
//! the one collaborator in the crate that does **not** follow the
//! fail-closed posture [`crate::rate_limit::SharedCounterLimiter`] uses,
//! because a stale/missing cache entry degrades latency, not correctness -
//! the caller always falls through to the recommender on a miss.

#[cfg(feature = "cache")]
use deadpool_redis::Pool as RedisPool;
#[cfg(feature = "cache")]
use redis::AsyncCommands;

use uuid::Uuid;

/// Build the cache key for a feed response: path, raw query string, and
/// the viewer's id (personalised responses must never be shared across
/// viewers; anonymous/global responses use `anon`).
pub fn cache_key(path: &str, raw_query: &str, viewer_id: Option<Uuid>) -> String {
    format!(
        "response:{}:{}:{}",
        path,
        raw_query,
        viewer_id.map(|id| id.to_string()).unwrap_or_else(|| "anon".to_string())
    )
}

/// Thin wrapper over the Redis pool used as a response cache.
#[cfg(feature = "cache")]
#[derive(Clone)]
pub struct ResponseCache {
    pool: Option<RedisPool>,
}

#[cfg(feature = "cache")]
impl ResponseCache {
    pub fn new(pool: Option<RedisPool>) -> Self {
        Self { pool }
    }

    /// Read a cached response body. Returns `None` on a miss or on any
    /// Redis failure - always fail-open.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let pool = self.pool.as_ref()?;
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("response cache unreachable, treating as miss: {}", e);
                return None;
            }
        };
        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("response cache read failed, treating as miss: {}", e);
                None
            }
        }
    }

    /// Write a cached response body with a TTL. Failures are logged and
    /// swallowed - a response that never got cached is only a latency
    /// regression, not a correctness bug.
    pub async fn put(&self, key: &str, bytes: &[u8], ttl_secs: u64) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("response cache unreachable, skipping write: {}", e);
                return;
            }
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(key, bytes, ttl_secs).await {
            tracing::warn!("response cache write failed: {}", e);
        }
    }

    /// Invalidate every cached entry matching `pattern` (e.g.
    /// `response:/feed/for-you:*:<user-id>`), via `SCAN` + `DEL` so a large
    /// keyspace doesn't block Redis the way `KEYS` would.
    pub async fn invalidate_pattern(&self, pattern: &str) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("response cache unreachable, skipping invalidation: {}", e);
                return;
            }
        };

        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("response cache scan failed: {}", e);
                    return;
                }
            };

            if !keys.is_empty() {
                if let Err(e) = conn.del::<_, ()>(&keys).await {
                    tracing::warn!("response cache invalidation delete failed: {}", e);
                }
            }

            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_some()
    }
}

#[cfg(all(test, feature = "cache"))]
mod tests {
    use super::*;

    #[test]
    fn cache_key_separates_personalised_and_anonymous() {
        let user = Uuid::new_v4();
        let personal = cache_key("/feed/for-you", "limit=10", Some(user));
        let anon = cache_key("/feed/popular", "limit=10", None);
        assert!(personal.ends_with(&user.to_string()));
        assert!(anon.ends_with("anon"));
        assert_ne!(personal, anon);
    }

    #[tokio::test]
    async fn disconnected_cache_is_a_transparent_miss() {
        let cache = ResponseCache::new(None);
        assert!(!cache.is_connected());
        assert!(cache.get("anything").await.is_none());
        cache.put("anything", b"value", 60).await;
        cache.invalidate_pattern("anything*").await;
    }
}
