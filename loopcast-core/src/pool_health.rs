//! Connection pool health monitoring

use serde::{Deserialize, Serialize};

/// Database connection pool health metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg(feature = "database")]
pub struct DatabasePoolHealth {
    /// Total number of connections in the pool
    pub size: u32,

    /// Number of idle connections available
    pub idle: usize,

    /// Maximum pool size configured
    pub max_size: u32,

    /// Minimum pool size configured
    pub min_size: u32,

    /// Whether the pool is healthy
    pub healthy: bool,

    /// Pool utilization percentage (0-100)
    pub utilization_percent: f32,
}

#[cfg(feature = "database")]
impl DatabasePoolHealth {
    /// Create health metrics from a PostgreSQL pool
    pub fn from_pool(pool: &sqlx::PgPool, config: &crate::config::DatabaseConfig) -> Self {
        let size = pool.size();
        let idle = pool.num_idle();
        let max_size = config.max_connections;
        let min_size = config.min_connections;

        let utilization_percent = if max_size > 0 {
            ((size as f32 / max_size as f32) * 100.0).min(100.0)
        } else {
            0.0
        };

        let healthy = size < max_size;

        Self {
            size,
            idle,
            max_size,
            min_size,
            healthy,
            utilization_percent,
        }
    }
}

/// Redis connection pool health metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg(feature = "cache")]
pub struct RedisPoolHealth {
    /// Maximum pool size configured
    pub max_size: usize,

    /// Whether the pool is available
    pub available: bool,

    /// Pool status description
    pub status: String,
}

#[cfg(feature = "cache")]
impl RedisPoolHealth {
    /// Create health metrics from a Redis pool
    pub fn from_pool(pool: &deadpool_redis::Pool, config: &crate::config::RedisConfig) -> Self {
        let max_size = config.max_connections;
        let status = pool.status();
        let available = status.size > 0 || status.available > 0;

        Self {
            max_size,
            available,
            status: format!("size={}, available={}", status.size, status.available),
        }
    }
}

/// Overall pool health summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthSummary {
    #[cfg(feature = "database")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabasePoolHealth>,

    #[cfg(feature = "cache")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisPoolHealth>,

    /// Collaborators that are configured but not yet connected, or not
    /// configured at all (optional dependencies only).
    #[serde(default)]
    pub degraded: Vec<String>,

    /// Overall healthy status
    pub healthy: bool,
}

impl PoolHealthSummary {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "database")]
            database: None,
            #[cfg(feature = "cache")]
            redis: None,
            degraded: Vec::new(),
            healthy: true,
        }
    }

    pub fn is_healthy(&self) -> bool {
        let database_healthy = {
            #[cfg(feature = "database")]
            { self.database.as_ref().map_or(true, |db| db.healthy) }
            #[cfg(not(feature = "database"))]
            { true }
        };

        let cache_healthy = {
            #[cfg(feature = "cache")]
            { self.redis.as_ref().map_or(true, |redis| redis.available) }
            #[cfg(not(feature = "cache"))]
            { true }
        };

        database_healthy && cache_healthy
    }
}

impl Default for PoolHealthSummary {
    fn default() -> Self {
        Self::new()
    }
}
