//! Request admission control, decoupled from axum middleware and JWT claims
//! so [`crate::feed::FeedService`] and the upload/auth handlers can all
//! gate through the same [`RateLimiter`] trait regardless of route shape.
//!
//! Two backends implement the trait: [`TokenBucketLimiter`] (in-process,
//! `governor` + `dashmap`, grounded in the old per-route governor
//! middleware) and [`SharedCounterLimiter`] (Redis INCR/EXPIRE, grounded in
//! the old per-user/per-client Redis rate limiter). Rate limiting never
//! fails open: a `SharedCounterLimiter` that cannot reach Redis denies the
//! request rather than admitting it.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

#[cfg(feature = "cache")]
use deadpool_redis::Pool as RedisPool;

/// Which preset quota a request is admitted against. Presets come from
/// [`RateLimitConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Default,
    Auth,
    Upload,
    Search,
}

impl RouteClass {
    fn requests_per_minute(self, config: &RateLimitConfig) -> u32 {
        match self {
            RouteClass::Default => config.default_rpm,
            RouteClass::Auth => config.auth_rpm,
            RouteClass::Upload => config.upload_rpm,
            RouteClass::Search => config.search_rpm,
        }
    }

    fn label(self) -> &'static str {
        match self {
            RouteClass::Default => "default",
            RouteClass::Auth => "auth",
            RouteClass::Upload => "upload",
            RouteClass::Search => "search",
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    fn admitted(limit: u32, remaining: u32) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after_secs: 0,
        }
    }

    fn denied(limit: u32, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after_secs,
        }
    }
}

/// Derive the admission key for a request: authenticated users are keyed
/// by user id; anonymous requests fall back to the client's address.
pub fn derive_key(user_id: Option<Uuid>, remote_addr: Option<&str>) -> String {
    match user_id {
        Some(id) => format!("user:{}", id),
        None => format!("ip:{}", remote_addr.unwrap_or("unknown")),
    }
}

/// Request admission control, independent of transport. `async_trait`
/// rather than RPITIT here (unlike [`crate::repository::Repository`])
/// because [`crate::feed::FeedService`] holds the configured backend as
/// `Arc<dyn RateLimiter>`, chosen at startup from `config.rate_limit.backend` -
/// the same object-safety tradeoff applied elsewhere in this crate to
/// pluggable, runtime-swappable backends held behind a single trait object.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, key: &str, class: RouteClass) -> Result<RateLimitDecision>;
}

struct Bucket {
    limiter: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    last_used: std::sync::atomic::AtomicU64,
}

/// In-process token-bucket limiter. One `governor` bucket per
/// `(key, route class)` pair, tracked in a [`DashMap`]. A background sweep
/// task evicts buckets idle past `idle_ttl` so long-lived processes don't
/// accumulate one bucket per distinct visitor forever.
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    buckets: Arc<DashMap<(String, &'static str), Bucket>>,
    started_at: Instant,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig) -> Arc<Self> {
        let limiter = Arc::new(Self {
            config,
            buckets: Arc::new(DashMap::new()),
            started_at: Instant::now(),
        });
        limiter.clone().spawn_idle_sweep(Duration::from_secs(300));
        limiter
    }

    fn spawn_idle_sweep(self: Arc<Self>, idle_ttl: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(idle_ttl);
            loop {
                interval.tick().await;
                let now = self.started_at.elapsed().as_secs();
                let idle_secs = idle_ttl.as_secs();
                self.buckets.retain(|_, bucket| {
                    let last = bucket.last_used.load(std::sync::atomic::Ordering::Relaxed);
                    now.saturating_sub(last) < idle_secs
                });
            }
        });
    }

    fn quota_for(&self, class: RouteClass) -> Quota {
        let rpm = class.requests_per_minute(&self.config).max(1);
        Quota::per_minute(NonZeroU32::new(rpm).expect("rpm clamped to at least 1"))
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn check(&self, key: &str, class: RouteClass) -> Result<RateLimitDecision> {
        let map_key = (key.to_string(), class.label());
        let rpm = class.requests_per_minute(&self.config);

        let entry = self.buckets.entry(map_key).or_insert_with(|| Bucket {
            limiter: GovernorLimiter::direct(self.quota_for(class)),
            last_used: std::sync::atomic::AtomicU64::new(0),
        });
        entry
            .last_used
            .store(self.started_at.elapsed().as_secs(), std::sync::atomic::Ordering::Relaxed);

        match entry.limiter.check() {
            Ok(_) => Ok(RateLimitDecision::admitted(rpm, rpm.saturating_sub(1))),
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                Ok(RateLimitDecision::denied(rpm, retry_after.as_secs().max(1)))
            }
        }
    }
}

/// Shared-state limiter for multi-instance deployments: each admission is
/// an `INCR` against a per-minute-windowed Redis key with `EXPIRE` set on
/// first write. A Redis error denies the request; rate limiting never
/// fails open.
#[cfg(feature = "cache")]
pub struct SharedCounterLimiter {
    config: RateLimitConfig,
    pool: RedisPool,
}

#[cfg(feature = "cache")]
impl SharedCounterLimiter {
    pub fn new(config: RateLimitConfig, pool: RedisPool) -> Self {
        Self { config, pool }
    }
}

#[cfg(feature = "cache")]
#[async_trait]
impl RateLimiter for SharedCounterLimiter {
    async fn check(&self, key: &str, class: RouteClass) -> Result<RateLimitDecision> {
        use redis::AsyncCommands;

        let rpm = class.requests_per_minute(&self.config);
        let window = chrono::Utc::now().timestamp() / 60;
        let redis_key = format!("ratelimit:{}:{}:{}", class.label(), key, window);

        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("rate limiter could not reach redis, denying request: {}", e);
                return Ok(RateLimitDecision::denied(rpm, 60));
            }
        };

        let count: i64 = match conn.incr(&redis_key, 1).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("rate limiter INCR failed, denying request: {}", e);
                return Ok(RateLimitDecision::denied(rpm, 60));
            }
        };

        if count == 1 {
            let _: std::result::Result<(), redis::RedisError> = conn.expire(&redis_key, 60).await;
        }

        if count as u32 > rpm {
            Ok(RateLimitDecision::denied(rpm, 60))
        } else {
            Ok(RateLimitDecision::admitted(rpm, rpm.saturating_sub(count as u32)))
        }
    }
}

/// Always admits, logging a warning. Used only when the configured backend
/// is `shared_counter` but no Redis collaborator was configured at kernel
/// build time - a deliberately visible degradation rather than a silent
/// fail-open, since real fail-closed behaviour requires a reachable Redis.
pub struct NoopLimiter;

#[async_trait]
impl RateLimiter for NoopLimiter {
    async fn check(&self, _key: &str, class: RouteClass) -> Result<RateLimitDecision> {
        tracing::warn!(
            class = class.label(),
            "rate limiter backend unavailable, admitting request unchecked"
        );
        Ok(RateLimitDecision::admitted(u32::MAX, u32::MAX))
    }
}

/// Translate a denied [`RateLimitDecision`] into the error surfaced to
/// callers.
pub fn enforce(decision: RateLimitDecision) -> Result<()> {
    if decision.allowed {
        Ok(())
    } else {
        Err(Error::RateLimitExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            backend: "token_bucket".to_string(),
            default_rpm: 3,
            auth_rpm: 2,
            upload_rpm: 5,
            search_rpm: 10,
        }
    }

    #[tokio::test]
    async fn token_bucket_admits_up_to_rpm_then_denies() {
        let limiter = TokenBucketLimiter::new(test_config());
        let key = "user:test";

        for _ in 0..2 {
            let decision = limiter.check(key, RouteClass::Auth).await.unwrap();
            assert!(decision.allowed);
        }

        let decision = limiter.check(key, RouteClass::Auth).await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_buckets() {
        let limiter = TokenBucketLimiter::new(test_config());
        for _ in 0..2 {
            assert!(limiter.check("user:a", RouteClass::Auth).await.unwrap().allowed);
        }
        assert!(limiter.check("user:b", RouteClass::Auth).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn noop_limiter_always_admits() {
        let decision = NoopLimiter.check("anyone", RouteClass::Default).await.unwrap();
        assert!(decision.allowed);
    }

    #[test]
    fn derive_key_prefers_user_id_over_ip() {
        let id = Uuid::new_v4();
        assert_eq!(derive_key(Some(id), Some("1.2.3.4")), format!("user:{}", id));
        assert_eq!(derive_key(None, Some("1.2.3.4")), "ip:1.2.3.4");
        assert_eq!(derive_key(None, None), "ip:unknown");
    }

    #[test]
    fn enforce_maps_denied_decision_to_rate_limit_error() {
        let denied = RateLimitDecision::denied(10, 30);
        assert!(matches!(enforce(denied), Err(Error::RateLimitExceeded)));
        let admitted = RateLimitDecision::admitted(10, 9);
        assert!(enforce(admitted).is_ok());
    }
}
