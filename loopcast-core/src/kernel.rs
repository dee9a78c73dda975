//! Service locator for Loop's collaborators: the post/user store, the
//! response cache, the recommendation gateway client, the audio analyser
//! sidecar client, the blob object store, and the audio processing queue.
//!
//! `Kernel` replaces the old generic `AppState<T>` pattern with a
//! non-generic registry built once at startup via [`KernelBuilder`] and
//! shared behind an `Arc` through the rest of the process. Required
//! collaborators (store, recommender, auth key, audio processor) fail
//! fast during [`Kernel::validate`]; optional collaborators (cache,
//! analyser) connect lazily in the background and are reported via
//! [`Kernel::degraded_warnings`] until they come up.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::{Error, Result};

#[cfg(feature = "database")]
use sqlx::PgPool;

#[cfg(feature = "cache")]
use deadpool_redis::Pool as RedisPool;

type Cleanup = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Default)]
struct Collaborators {
    #[cfg(feature = "database")]
    db: Option<PgPool>,
    #[cfg(feature = "cache")]
    redis: Option<RedisPool>,
}

/// Central registry of service collaborators.
///
/// Cheaply cloneable; internal state lives behind `Arc`.
#[derive(Clone)]
pub struct Kernel {
    config: Arc<Config>,
    collaborators: Arc<RwLock<Collaborators>>,
    recommender_client: reqwest::Client,
    analyser_client: Option<reqwest::Client>,
    cleanups: Arc<tokio::sync::Mutex<Vec<Cleanup>>>,
}

impl Kernel {
    /// Start building a kernel from configuration.
    pub fn builder(config: Config) -> KernelBuilder {
        KernelBuilder {
            config,
            eager_database: false,
            eager_cache: false,
        }
    }

    /// A kernel with no real backing services, for unit tests that only
    /// exercise routing/middleware and never touch a collaborator.
    pub fn testing() -> Self {
        Self {
            config: Arc::new(Config::default()),
            collaborators: Arc::new(RwLock::new(Collaborators::default())),
            recommender_client: reqwest::Client::new(),
            analyser_client: None,
            cleanups: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[cfg(feature = "database")]
    pub async fn db(&self) -> Option<PgPool> {
        self.collaborators.read().await.db.clone()
    }

    #[cfg(feature = "cache")]
    pub async fn redis(&self) -> Option<RedisPool> {
        self.collaborators.read().await.redis.clone()
    }

    /// The recommendation gateway HTTP client. Always present: the
    /// recommender is a required collaborator.
    pub fn recommender(&self) -> &reqwest::Client {
        &self.recommender_client
    }

    /// The audio analyser sidecar HTTP client, if `analyser` is configured.
    pub fn analyser(&self) -> Option<&reqwest::Client> {
        self.analyser_client.as_ref()
    }

    pub fn object_store_root(&self) -> &std::path::Path {
        &self.config.object_store.root
    }

    /// Enumerate missing required collaborators as a single aggregated
    /// error. Required: store (database), recommender base URL, PASETO
    /// key material, and audio queue configuration.
    pub async fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        #[cfg(feature = "database")]
        {
            if self.collaborators.read().await.db.is_none() {
                missing.push("database (post/user store)");
            }
        }
        #[cfg(not(feature = "database"))]
        missing.push("database feature not compiled in");

        if self.config.recommender.base_url.trim().is_empty() {
            missing.push("recommender.base_url");
        }

        if !self.config.paseto.key_path.exists() {
            missing.push("paseto.key_path (auth/identity provider)");
        }

        if self.config.audio_queue.effective_worker_count() == 0 {
            missing.push("audio_queue.worker_count resolved to zero");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(Box::new(figment::Error::from(format!(
                "Kernel validation failed, missing required collaborators: {}",
                missing.join(", ")
            )))))
        }
    }

    /// Optional collaborators that are configured but not yet connected,
    /// or not configured at all. Does not fail startup.
    pub async fn degraded_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        #[cfg(feature = "cache")]
        {
            if self.config.redis.is_some() && self.collaborators.read().await.redis.is_none() {
                warnings.push("redis configured but not yet connected".to_string());
            } else if self.config.redis.is_none() {
                warnings.push("redis not configured, response cache disabled".to_string());
            }
        }

        if self.config.analyser.is_none() {
            warnings.push("analyser not configured, acoustic feature extraction disabled".to_string());
        }

        warnings
    }

    /// Register a cleanup closure, run in LIFO order by [`Kernel::shutdown`].
    pub async fn on_cleanup<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cleanups.lock().await.push(Box::new(move || Box::pin(f())));
    }

    /// Run all registered cleanups in reverse registration order.
    pub async fn shutdown(&self) {
        let mut cleanups = self.cleanups.lock().await;
        while let Some(cleanup) = cleanups.pop() {
            cleanup().await;
        }
    }
}

/// Fluent builder for [`Kernel`].
pub struct KernelBuilder {
    config: Config,
    eager_database: bool,
    eager_cache: bool,
}

impl KernelBuilder {
    /// Fail fast on database connect instead of retrying in the background.
    pub fn eager_database(mut self) -> Self {
        self.eager_database = true;
        self
    }

    /// Fail fast on Redis connect instead of retrying in the background.
    pub fn eager_cache(mut self) -> Self {
        self.eager_cache = true;
        self
    }

    pub async fn build(self) -> Result<Kernel> {
        let config = Arc::new(self.config);
        let collaborators = Arc::new(RwLock::new(Collaborators::default()));

        #[cfg(feature = "database")]
        if let Some(db_config) = config.database.clone() {
            if self.eager_database {
                let pool = crate::database::create_pool(&db_config).await?;
                collaborators.write().await.db = Some(pool);
            } else {
                let collaborators = collaborators.clone();
                tokio::spawn(async move {
                    match crate::database::create_pool(&db_config).await {
                        Ok(pool) => collaborators.write().await.db = Some(pool),
                        Err(e) => tracing::error!("database unavailable, store degraded: {}", e),
                    }
                });
            }
        }

        #[cfg(feature = "cache")]
        if let Some(redis_config) = config.redis.clone() {
            if self.eager_cache {
                let pool = crate::cache::create_pool(&redis_config).await?;
                collaborators.write().await.redis = Some(pool);
            } else {
                let collaborators = collaborators.clone();
                tokio::spawn(async move {
                    match crate::cache::create_pool(&redis_config).await {
                        Ok(pool) => collaborators.write().await.redis = Some(pool),
                        Err(e) => tracing::warn!("redis unavailable, response cache degraded: {}", e),
                    }
                });
            }
        }

        let recommender_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.recommender.timeout_secs))
            .build()
            .map_err(Error::from)?;

        let analyser_client = match &config.analyser {
            Some(analyser_config) => Some(
                reqwest::Client::builder()
                    .timeout(Duration::from_secs(analyser_config.timeout_secs))
                    .build()
                    .map_err(Error::from)?,
            ),
            None => None,
        };

        Ok(Kernel {
            config,
            collaborators,
            recommender_client,
            analyser_client,
            cleanups: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn testing_kernel_has_no_collaborators() {
        let kernel = Kernel::testing();
        assert!(kernel.analyser().is_none());
        let warnings = kernel.degraded_warnings().await;
        assert!(!warnings.is_empty());
    }

    #[tokio::test]
    async fn cleanup_runs_lifo() {
        let kernel = Kernel::testing();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        kernel.on_cleanup(move || async move { o1.lock().await.push(1) }).await;
        let o2 = order.clone();
        kernel.on_cleanup(move || async move { o2.lock().await.push(2) }).await;

        kernel.shutdown().await;
        assert_eq!(*order.lock().await, vec![2, 1]);
    }
}
