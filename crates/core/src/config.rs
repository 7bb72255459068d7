//! Centralized configuration management.
//!
//! All configuration is loaded from environment variables at startup.
//! This provides a single source of truth and fails fast if required config is missing.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub valkey: ValkeyConfig,
    pub nats: NatsConfig,
    pub embedding: EmbeddingConfig,
    pub enrichment: EnrichmentConfig,
    pub clustering: ClusteringConfig,
    pub dispatcher: DispatcherConfig,
    pub observability: ObservabilityConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Valkey (Redis-compatible) configuration for the work queue, the
/// per-discussion reclustering lock and the deferred-idea queues.
#[derive(Debug, Clone)]
pub struct ValkeyConfig {
    pub url: String,
    /// List key holding the persistent FIFO of idea-process jobs
    pub work_queue_key: String,
    /// Prefix for per-discussion reclustering lock keys
    pub lock_key_prefix: String,
    /// Prefix for per-discussion deferred-idea list keys
    pub deferred_key_prefix: String,
}

/// NATS configuration
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
}

/// Embedding inference API configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// URL of the embedding inference API service
    pub url: String,
    pub model: String,
    /// Maximum concurrent embedding RPCs across the whole process
    pub max_concurrent: usize,
    /// Global embedding call rate (calls per second)
    pub rate_per_sec: u32,
    /// Retry attempts for rate-limited responses
    pub max_retries: u32,
    pub timeout: Duration,
}

/// Formatting + summarization (LLM inference API) configuration
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// URL of the LLM inference API service
    pub url: String,
    pub model: String,
    pub timeout: Duration,
}

/// Dual-engine clustering configuration
#[derive(Debug, Clone)]
pub struct ClusteringConfig {
    /// Member count at which a topic switches to the mature threshold
    pub maturity_threshold: i64,
    /// Similarity cutoff for new (immature) topics
    pub adaptive_threshold_high: f32,
    /// Similarity cutoff for mature topics
    pub adaptive_threshold_low: f32,
    /// Similarity threshold for the full recluster (distance = 1 - this)
    pub recluster_similarity: f32,
    /// Minimum cluster size kept as a group topic by the full recluster
    pub min_group_size: usize,
    /// Dataset size at which the full recluster switches to chunked mode
    pub chunk_size_small: usize,
    pub chunk_size_large: usize,
    /// DBSCAN parameters for the outlier mini-pass
    pub outlier_eps: f32,
    pub outlier_min_samples: usize,
    /// TTL on the per-discussion reclustering lock
    pub lock_ttl: Duration,
}

/// Dispatcher and batch processing configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Ideas pulled from the work queue per mega-batch
    pub mega_batch_size: usize,
    /// Blocking poll timeout on an empty work queue
    pub poll_timeout: Duration,
    /// Maximum per-discussion batches in flight
    pub max_concurrent_discussions: usize,
    /// Interval between cleanup passes
    pub cleanup_interval: Duration,
    /// Ideas stuck in `processing` longer than this are reclassified
    pub stuck_after: Duration,
}

/// Observability configuration
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub service_name: String,
    pub log_format: LogFormat,
}

/// Log format type
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            valkey: ValkeyConfig::from_env()?,
            nats: NatsConfig::from_env()?,
            embedding: EmbeddingConfig::from_env()?,
            enrichment: EnrichmentConfig::from_env()?,
            clustering: ClusteringConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            observability: ObservabilityConfig::from_env(),
        })
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            acquire_timeout: Duration::from_secs(env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", 30)),
        })
    }
}

impl ValkeyConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("VALKEY_URL")
                .or_else(|_| env::var("REDIS_URL"))
                .context("VALKEY_URL (or REDIS_URL) must be set")?,
            work_queue_key: env_or("WORK_QUEUE_KEY", "ideas:work_queue"),
            lock_key_prefix: env_or("CLUSTERING_LOCK_KEY_PREFIX", "clustering:lock:"),
            deferred_key_prefix: env_or("CLUSTERING_DEFERRED_KEY_PREFIX", "clustering:deferred:"),
        })
    }
}

impl NatsConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("NATS_URL").context("NATS_URL must be set")?,
        })
    }
}

impl EmbeddingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("EMBEDDING_API_URL").context("EMBEDDING_API_URL must be set")?,
            model: env_or("EMBEDDING_MODEL", "nomic-embed-text"),
            max_concurrent: env_parse("EMBEDDING_MAX_CONCURRENT", 50),
            rate_per_sec: env_parse("EMBEDDING_RATE_PER_SEC", 100),
            max_retries: env_parse("EMBEDDING_MAX_RETRIES", 3),
            timeout: Duration::from_secs(env_parse("EMBEDDING_TIMEOUT_SECS", 30)),
        })
    }
}

impl EnrichmentConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("LLM_API_URL").context("LLM_API_URL must be set")?,
            model: env_or("LLM_MODEL", "gemini-2.0-flash"),
            timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 30)),
        })
    }
}

impl ClusteringConfig {
    pub fn from_env() -> Self {
        Self {
            maturity_threshold: env_parse("CENTROID_TOPIC_MATURITY_THRESHOLD", 5),
            adaptive_threshold_high: env_parse("CENTROID_ADAPTIVE_THRESHOLD_HIGH", 0.70),
            adaptive_threshold_low: env_parse("CENTROID_ADAPTIVE_THRESHOLD_LOW", 0.60),
            recluster_similarity: env_parse("FULL_RECLUSTER_SIMILARITY_THRESHOLD", 0.70),
            min_group_size: env_parse("FULL_RECLUSTER_MIN_GROUP_SIZE", 2),
            chunk_size_small: env_parse("FULL_RECLUSTER_CHUNK_SIZE_SMALL", 2000),
            chunk_size_large: env_parse("FULL_RECLUSTER_CHUNK_SIZE_LARGE", 5000),
            outlier_eps: env_parse("OUTLIER_DBSCAN_EPS", 0.25),
            outlier_min_samples: env_parse("OUTLIER_DBSCAN_MIN_SAMPLES", 2),
            lock_ttl: Duration::from_secs(env_parse("CLUSTERING_LOCK_TTL_SECS", 300)),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        Self {
            mega_batch_size: env_parse("MEGA_BATCH_SIZE", 2000),
            poll_timeout: Duration::from_millis(env_parse("QUEUE_POLL_TIMEOUT_MS", 100)),
            max_concurrent_discussions: env_parse("MAX_CONCURRENT_BATCHES", 20),
            cleanup_interval: Duration::from_secs(env_parse("CLEANUP_INTERVAL_SECS", 300)),
            stuck_after: Duration::from_secs(env_parse("STUCK_AFTER_SECS", 600)),
        }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        let log_format = match env_or("LOG_FORMAT", "json").to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        Self {
            service_name: env_or("SERVICE_NAME", "idearoom-worker"),
            log_format,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
