//! Health check handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{error::Error, kernel::Kernel, pool_health::PoolHealthSummary};

#[cfg(feature = "database")]
use crate::pool_health::DatabasePoolHealth;
#[cfg(feature = "cache")]
use crate::pool_health::RedisPoolHealth;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Readiness check response with dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub service: String,
    pub dependencies: HashMap<String, DependencyStatus>,
}

/// Individual dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Simple liveness probe. Always returns 200 OK if the process is running.
pub async fn health(State(kernel): State<Kernel>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        service: kernel.config().service.name.clone(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };

    (StatusCode::OK, Json(response))
}

/// Readiness probe. Returns 503 if any *required* collaborator is down;
/// optional collaborators (cache, analyser) only widen `dependencies`
/// without failing readiness.
pub async fn readiness(State(kernel): State<Kernel>) -> Result<impl IntoResponse, Error> {
    let mut dependencies = HashMap::new();
    let mut all_ready = true;

    #[cfg(feature = "database")]
    {
        match kernel.db().await {
            Some(db_pool) => match sqlx::query("SELECT 1").fetch_one(&db_pool).await {
                Ok(_) => {
                    dependencies.insert(
                        "database".to_string(),
                        DependencyStatus { healthy: true, message: Some("Connected".to_string()) },
                    );
                }
                Err(e) => {
                    tracing::error!("database health check failed: {}", e);
                    all_ready = false;
                    dependencies.insert(
                        "database".to_string(),
                        DependencyStatus {
                            healthy: false,
                            message: Some(format!("Connection failed: {}", e)),
                        },
                    );
                }
            },
            None => {
                all_ready = false;
                dependencies.insert(
                    "database".to_string(),
                    DependencyStatus {
                        healthy: false,
                        message: Some("Not connected (lazy init in progress or exhausted)".to_string()),
                    },
                );
            }
        }
    }

    #[cfg(feature = "cache")]
    {
        if kernel.config().redis.is_some() {
            match kernel.redis().await {
                Some(redis_pool) => match redis_pool.get().await {
                    Ok(mut conn) => {
                        use std::ops::DerefMut;
                        match redis::cmd("PING").query_async::<String>(conn.deref_mut()).await {
                            Ok(_) => {
                                dependencies.insert(
                                    "redis".to_string(),
                                    DependencyStatus { healthy: true, message: Some("Connected".to_string()) },
                                );
                            }
                            Err(e) => {
                                // Redis is an optional collaborator: degraded, not unready.
                                tracing::warn!("redis ping failed: {}", e);
                                dependencies.insert(
                                    "redis".to_string(),
                                    DependencyStatus {
                                        healthy: false,
                                        message: Some(format!("Ping failed: {}", e)),
                                    },
                                );
                            }
                        }
                    }
                    Err(e) => {
                        dependencies.insert(
                            "redis".to_string(),
                            DependencyStatus {
                                healthy: false,
                                message: Some(format!("Connection pool error: {}", e)),
                            },
                        );
                    }
                },
                None => {
                    dependencies.insert(
                        "redis".to_string(),
                        DependencyStatus {
                            healthy: false,
                            message: Some("Connection initializing (lazy mode)".to_string()),
                        },
                    );
                }
            }
        }
    }

    for warning in kernel.degraded_warnings().await {
        dependencies
            .entry("degraded".to_string())
            .or_insert(DependencyStatus { healthy: true, message: None })
            .message = Some(warning);
    }

    let response = ReadinessResponse {
        ready: all_ready,
        service: kernel.config().service.name.clone(),
        dependencies,
    };

    let status = if all_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    Ok((status, Json(response)))
}

/// Pool health metrics endpoint: connection pool size/utilization plus
/// any degraded optional collaborators.
pub async fn pool_metrics(State(kernel): State<Kernel>) -> impl IntoResponse {
    let mut summary = PoolHealthSummary::new();

    #[cfg(feature = "database")]
    if let (Some(pool), Some(db_config)) = (kernel.db().await, kernel.config().database.as_ref()) {
        summary.database = Some(DatabasePoolHealth::from_pool(&pool, db_config));
    }

    #[cfg(feature = "cache")]
    if let (Some(pool), Some(redis_config)) = (kernel.redis().await, kernel.config().redis.as_ref()) {
        summary.redis = Some(RedisPoolHealth::from_pool(&pool, redis_config));
    }

    summary.degraded = kernel.degraded_warnings().await;
    summary.healthy = summary.is_healthy();

    let status = if summary.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (status, Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            service: "test-service".to_string(),
            version: Some("1.0.0".to_string()),
        };

        assert_eq!(response.status, "healthy");
        assert_eq!(response.service, "test-service");
    }

    #[test]
    fn test_dependency_status() {
        let status = DependencyStatus { healthy: true, message: Some("OK".to_string()) };
        assert!(status.healthy);
        assert_eq!(status.message, Some("OK".to_string()));
    }
}
