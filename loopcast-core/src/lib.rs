//! # loopcast-core
//!
//! Serving-plane library for Loop: feed composition, the recommendation
//! gateway client, rate limiting, the response cache, and the bounded
//! audio-ingest processing queue.
//!
//! ## Example
//!
//! ```rust,no_run
//! use loopcast_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let kernel = Kernel::builder(config.clone()).build().await?;
//!     kernel.validate().await?;
//!
//!     let app = Router::new()
//!         .route("/health", get(health))
//!         .route("/ready", get(readiness))
//!         .with_state(kernel);
//!
//!     Server::new(config).serve(app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod kernel;
pub mod middleware;
pub mod health;
pub mod pool_health;
pub mod responses;
pub mod server;
pub mod observability;

#[cfg(feature = "database")]
pub mod database;

#[cfg(feature = "cache")]
pub mod cache;

#[cfg(feature = "database")]
pub mod repository;

pub mod domain;
pub mod store;
pub mod object_store;
pub mod recommender;
pub mod feed;
pub mod rate_limit;
pub mod audio;
pub mod analyser;
pub mod codec;

#[cfg(feature = "cache")]
pub mod response_cache;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        AnalyserConfig, AudioQueueConfig, Config, ObjectStoreConfig, PasetoConfig,
        RateLimitConfig, RecommenderConfig,
    };

    pub use crate::error::{Error, Result};
    pub use crate::health::{health, pool_metrics, readiness};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::kernel::{Kernel, KernelBuilder};
    pub use crate::pool_health::PoolHealthSummary;

    #[cfg(feature = "database")]
    pub use crate::pool_health::DatabasePoolHealth;

    #[cfg(feature = "cache")]
    pub use crate::pool_health::RedisPoolHealth;

    pub use crate::middleware::{
        admin_impersonation_layer, correlation_layer, request_id_layer,
        request_id_propagation_layer, sensitive_headers_layer, Claims, CorrelationId,
        PasetoAuth, RequestTrackingConfig, TokenValidator, CORRELATION_ID_HEADER,
        PROPAGATE_HEADERS, SENSITIVE_HEADERS,
    };

    #[cfg(feature = "otel-metrics")]
    pub use crate::middleware::{metric_labels, metric_names, MetricsConfig};

    pub use crate::server::Server;

    pub use crate::responses::{
        Accepted, Conflict, Created, FieldError, NoContent, Success, ValidationError,
    };

    pub use crate::observability::{init_tracing, shutdown_tracing};

    pub use crate::domain::{Post, PlayHistoryEntry, SocialEdge, User};
    pub use crate::store::{PostStore, SocialGraphStore, UserStore};
    pub use crate::object_store::ObjectStore;
    pub use crate::recommender::{RecommendedPost, RecommenderClient};
    pub use crate::feed::{FeedCursor, FeedItem, FeedKind, FeedPage, FeedParams, FeedService};
    pub use crate::rate_limit::{RateLimitDecision, RateLimiter, RouteClass};

    #[cfg(feature = "cache")]
    pub use crate::response_cache::ResponseCache;

    pub use crate::audio::{AudioJob, AudioJobId, AudioJobStatus, AudioQueue, QueueSubmitError};
    pub use crate::analyser::AnalyserClient;
    pub use crate::codec::AcousticFingerprint;

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    pub use tokio;

    pub use async_trait::async_trait;

    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};

    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

    pub use uuid::Uuid;

    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    pub use http::{Method, Uri};
}
