//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: `LOOPCAST_`)
//! 2. Current working directory: `./config.toml`
//! 3. XDG config directory: `~/.config/loopcast/{service_name}/config.toml`
//! 4. System directory: `/etc/loopcast/{service_name}/config.toml`
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub paseto: PasetoConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    pub recommender: RecommenderConfig,
    #[serde(default)]
    pub analyser: Option<AnalyserConfig>,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub audio_queue: AudioQueueConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// PASETO token validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasetoConfig {
    /// Path to the symmetric (v4.local) or public (v4.public) key
    pub key_path: PathBuf,
    /// "v4"
    #[serde(default = "default_paseto_version")]
    pub version: String,
    /// "local" or "public"
    #[serde(default = "default_paseto_purpose")]
    pub purpose: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

/// Rate limiting configuration, per route-class presets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Backend: "token_bucket" (in-process, governor) or "shared_counter" (redis)
    #[serde(default = "default_rate_limit_backend")]
    pub backend: String,
    #[serde(default = "default_rpm_default")]
    pub default_rpm: u32,
    #[serde(default = "default_rpm_auth")]
    pub auth_rpm: u32,
    #[serde(default = "default_rpm_upload")]
    pub upload_rpm: u32,
    #[serde(default = "default_rpm_search")]
    pub search_rpm: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            backend: default_rate_limit_backend(),
            default_rpm: default_rpm_default(),
            auth_rpm: default_rpm_auth(),
            upload_rpm: default_rpm_upload(),
            search_rpm: default_rpm_search(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Recommendation gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommenderConfig {
    pub base_url: String,
    #[serde(default = "default_recommender_timeout")]
    pub timeout_secs: u64,
}

/// Audio analyser (acoustic feature extraction) sidecar configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyserConfig {
    pub base_url: String,
    #[serde(default = "default_analyser_timeout")]
    pub timeout_secs: u64,
}

/// Object store configuration (audio + waveform blob storage)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_object_store_root")]
    pub root: PathBuf,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            root: default_object_store_root(),
        }
    }
}

/// Audio processing worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioQueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub channel_capacity: usize,
    /// Override worker count; 0 means min(num_cpus, 8)
    #[serde(default)]
    pub worker_count: usize,
    #[serde(default = "default_job_deadline")]
    pub job_deadline_secs: u64,
}

impl Default for AudioQueueConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_queue_capacity(),
            worker_count: 0,
            job_deadline_secs: default_job_deadline(),
        }
    }
}

impl AudioQueueConfig {
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get().min(8).max(1)
        } else {
            self.worker_count
        }
    }

    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.job_deadline_secs)
    }
}

/// Middleware configuration (all optional, feature-gated)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(default)]
    pub request_tracking: RequestTrackingConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub governor: Option<LocalRateLimitConfig>,
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
    #[serde(default = "default_true")]
    pub catch_panic: bool,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            request_tracking: RequestTrackingConfig::default(),
            metrics: None,
            governor: None,
            body_limit_mb: default_body_limit_mb(),
            catch_panic: true,
            compression: true,
            cors_mode: default_cors_mode(),
        }
    }
}

/// Request tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTrackingConfig {
    #[serde(default = "default_true")]
    pub request_id_enabled: bool,
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
    #[serde(default = "default_true")]
    pub propagate_headers: bool,
    #[serde(default = "default_true")]
    pub mask_sensitive_headers: bool,
}

impl Default for RequestTrackingConfig {
    fn default() -> Self {
        Self {
            request_id_enabled: true,
            request_id_header: default_request_id_header(),
            propagate_headers: true,
            mask_sensitive_headers: true,
        }
    }
}

/// HTTP metrics configuration (OpenTelemetry)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_latency_buckets")]
    pub latency_buckets_ms: Vec<f64>,
}

impl MetricsConfig {
    pub fn latency_buckets_as_duration(&self) -> Vec<Duration> {
        self.latency_buckets_ms
            .iter()
            .map(|&ms| Duration::from_millis(ms as u64))
            .collect()
    }
}

/// Local rate limiting configuration (governor-based token bucket)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalRateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_governor_requests")]
    pub requests_per_period: u32,
    #[serde(default = "default_governor_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_governor_burst")]
    pub burst_size: u32,
}

impl LocalRateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

// Default value functions
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_environment() -> String {
    "dev".to_string()
}
fn default_paseto_version() -> String {
    "v4".to_string()
}
fn default_paseto_purpose() -> String {
    "local".to_string()
}
fn default_rate_limit_backend() -> String {
    "token_bucket".to_string()
}
fn default_rpm_default() -> u32 {
    100
}
fn default_rpm_auth() -> u32 {
    10
}
fn default_rpm_upload() -> u32 {
    20
}
fn default_rpm_search() -> u32 {
    100
}
fn default_max_connections() -> u32 {
    50
}
fn default_min_connections() -> u32 {
    5
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_redis_max_connections() -> usize {
    20
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    2
}
fn default_body_limit_mb() -> usize {
    10
}
fn default_cors_mode() -> String {
    "permissive".to_string()
}
fn default_request_id_header() -> String {
    "x-request-id".to_string()
}
fn default_latency_buckets() -> Vec<f64> {
    vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
}
fn default_governor_requests() -> u32 {
    100
}
fn default_governor_period_secs() -> u64 {
    60
}
fn default_governor_burst() -> u32 {
    10
}
fn default_recommender_timeout() -> u64 {
    10
}
fn default_analyser_timeout() -> u64 {
    90
}
fn default_object_store_root() -> PathBuf {
    PathBuf::from("./data/objects")
}
fn default_queue_capacity() -> usize {
    100
}
fn default_job_deadline() -> u64 {
    300
}

impl Config {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "loopcast-server".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("LOOPCAST_").split("_"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file, bypassing XDG directories
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LOOPCAST_").split("_"))
            .extract()?;

        Ok(config)
    }

    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("loopcast");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/loopcast").join(service_name).join("config.toml"));

        paths
    }

    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.redis.as_ref().map(|r| r.url.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "loopcast-server".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
            },
            paseto: PasetoConfig {
                key_path: PathBuf::from("./keys/paseto-local.key"),
                version: default_paseto_version(),
                purpose: default_paseto_purpose(),
                issuer: None,
                audience: None,
            },
            rate_limit: RateLimitConfig::default(),
            middleware: MiddlewareConfig::default(),
            database: None,
            redis: None,
            recommender: RecommenderConfig {
                base_url: "http://localhost:9100".to_string(),
                timeout_secs: default_recommender_timeout(),
            },
            analyser: None,
            object_store: ObjectStoreConfig::default(),
            audio_queue: AudioQueueConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.rate_limit.default_rpm, 100);
        assert_eq!(config.rate_limit.auth_rpm, 10);
    }

    #[test]
    fn test_audio_queue_worker_count_defaults_to_cpu_bound() {
        let cfg = AudioQueueConfig::default();
        let n = cfg.effective_worker_count();
        assert!(n >= 1 && n <= 8);
    }

    #[test]
    fn test_audio_queue_worker_count_override() {
        let cfg = AudioQueueConfig {
            worker_count: 3,
            ..AudioQueueConfig::default()
        };
        assert_eq!(cfg.effective_worker_count(), 3);
    }
}
