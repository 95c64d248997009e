//! Layered service configuration: defaults, config files, then
//! `OPTIMIZER__*` environment overrides.

use pixforge_pipeline::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the optimizer service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Kafka configuration (uploads, tasks and dead letter topics)
    pub kafka: KafkaConfig,
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Variant catalog and quality policy
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Which stages this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    /// Consume object-created events and fan out per-width tasks
    Dispatcher,
    /// Consume per-width tasks and write variants
    Worker,
    /// Consume object-created events and produce every variant in one go
    Processor,
    /// Dispatcher and worker in one process
    #[default]
    All,
}

impl ServiceMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "dispatcher" => Some(ServiceMode::Dispatcher),
            "worker" => Some(ServiceMode::Worker),
            "processor" => Some(ServiceMode::Processor),
            "all" => Some(ServiceMode::All),
            _ => None,
        }
    }
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Deployment stage label (dev, staging, prod)
    #[serde(default = "default_stage")]
    pub stage: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Stages to run when no mode is given on the command line
    #[serde(default)]
    pub mode: ServiceMode,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket receiving processed variants
    pub processed_bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Cache directive attached to every variant
    #[serde(default = "default_cache_control")]
    pub cache_control: String,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Encoder settings for one quality tier
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TierConfig {
    /// Compression quality, 0-100
    pub quality: u8,
    /// WebP encoder effort, 0-6
    pub effort: u8,
}

/// Variant catalog and quality policy
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Thumbnail-class widths
    #[serde(default = "default_thumbnail_widths")]
    pub thumbnail_widths: Vec<u32>,
    /// Device-class widths
    #[serde(default = "default_device_widths")]
    pub device_widths: Vec<u32>,
    /// Widths up to this value use the small tier
    #[serde(default = "default_small_max_width")]
    pub small_max_width: u32,
    /// Widths up to this value use the medium tier, larger ones the large tier
    #[serde(default = "default_medium_max_width")]
    pub medium_max_width: u32,
    #[serde(default = "default_small_tier")]
    pub small: TierConfig,
    #[serde(default = "default_medium_tier")]
    pub medium: TierConfig,
    #[serde(default = "default_large_tier")]
    pub large: TierConfig,
    /// Added to the WebP effort to get the AVIF effort
    #[serde(default = "default_avif_effort_bonus")]
    pub avif_effort_bonus: u8,
    /// Narrowest width that also gets an AVIF variant
    #[serde(default = "default_avif_min_width")]
    pub avif_min_width: u32,
    /// Pinned encoder profile; change it whenever encoder versions or
    /// parameters change, since stored bytes are only reproducible per profile
    #[serde(default = "default_encoder_profile")]
    pub encoder_profile: String,
}

/// Worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Widths processed concurrently by the single-stage processor
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Time budget for one task or event before it is treated as failed
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

/// API configuration for the variant manifest endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "optimizer-service".to_string()
}

fn default_stage() -> String {
    "dev".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_cache_control() -> String {
    "public, max-age=31536000, immutable".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_thumbnail_widths() -> Vec<u32> {
    vec![16, 32, 48, 64, 96, 128, 256, 384]
}

fn default_device_widths() -> Vec<u32> {
    vec![640, 828, 1200, 1920, 2048, 3840]
}

fn default_small_max_width() -> u32 {
    384
}

fn default_medium_max_width() -> u32 {
    1080
}

fn default_small_tier() -> TierConfig {
    TierConfig {
        quality: 80,
        effort: 6,
    }
}

fn default_medium_tier() -> TierConfig {
    TierConfig {
        quality: 85,
        effort: 5,
    }
}

fn default_large_tier() -> TierConfig {
    TierConfig {
        quality: 90,
        effort: 4,
    }
}

fn default_avif_effort_bonus() -> u8 {
    2
}

fn default_avif_min_width() -> u32 {
    640
}

fn default_encoder_profile() -> String {
    "image-0.25+libwebp-0.3+ravif/v1".to_string()
}

fn default_chunk_size() -> usize {
    2
}

fn default_task_timeout_secs() -> u64 {
    120
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "optimizer-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("kafka.bootstrap_servers", "localhost:9092")?
            // Add config file if present
            .add_source(
                config::File::with_name("config/optimizer")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/pixforge/optimizer")
                    .required(false)
            )
            // Override with environment variables
            // OPTIMIZER__STORAGE__PROCESSED_BUCKET -> storage.processed_bucket
            .add_source(
                config::Environment::with_prefix("OPTIMIZER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("catalog.thumbnail_widths")
                    .with_list_parse_key("catalog.device_widths")
                    .with_list_parse_key("api.cors_origins")
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no stage could run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.processed_bucket.trim().is_empty() {
            anyhow::bail!("storage.processed_bucket must not be empty");
        }
        if self.worker.chunk_size == 0 {
            anyhow::bail!("worker.chunk_size must be at least 1");
        }
        if self.worker.task_timeout_secs == 0 {
            anyhow::bail!("worker.task_timeout_secs must be at least 1");
        }
        self.kafka.validate()?;
        crate::catalog::VariantCatalog::from_config(&self.catalog)?;
        Ok(())
    }

    /// Get the per-task time budget as Duration
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.task_timeout_secs)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.presigned_url_expiry_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            stage: default_stage(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            mode: ServiceMode::default(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            thumbnail_widths: default_thumbnail_widths(),
            device_widths: default_device_widths(),
            small_max_width: default_small_max_width(),
            medium_max_width: default_medium_max_width(),
            small: default_small_tier(),
            medium: default_medium_tier(),
            large: default_large_tier(),
            avif_effort_bonus: default_avif_effort_bonus(),
            avif_min_width: default_avif_min_width(),
            encoder_profile: default_encoder_profile(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "service": {},
            "kafka": { "bootstrap_servers": "localhost:9092" },
            "storage": { "processed_bucket": "pixforge-processed-dev" }
        }))
        .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = minimal_config();
        assert_eq!(config.service.stage, "dev");
        assert_eq!(config.service.mode, ServiceMode::All);
        assert_eq!(
            config.storage.cache_control,
            "public, max-age=31536000, immutable"
        );
        assert_eq!(config.catalog.avif_min_width, 640);
        assert_eq!(config.worker.chunk_size, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let mut config = minimal_config();
        config.storage.processed_bucket = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_catalog_rejected() {
        let mut config = minimal_config();
        config.catalog.medium.quality = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_mode_parse() {
        assert_eq!(ServiceMode::parse("Worker"), Some(ServiceMode::Worker));
        assert_eq!(ServiceMode::parse("processor"), Some(ServiceMode::Processor));
        assert_eq!(ServiceMode::parse("lambda"), None);
    }
}
