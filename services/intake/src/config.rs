use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Smallest part size S3 accepts for every part except the last one.
pub const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main configuration for the intake service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Telegram Bot API configuration
    pub telegram: TelegramConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Downstream dispatch configuration
    pub dispatch: DispatchConfig,
    /// Admission and worker limits
    #[serde(default)]
    pub intake: IntakeConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Provenance tag written into object metadata and job messages
    #[serde(default = "default_source_tag")]
    pub source_tag: String,
}

/// Telegram Bot API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    pub bot_token: String,
    /// API base URL (point at a local Bot API server to lift the 20 MB download cap)
    #[serde(default = "default_telegram_api_url")]
    pub api_base_url: String,
    /// Long-poll timeout for getUpdates in seconds
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Timeout for ordinary API requests in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Abort a file download when no bytes arrive for this many seconds
    #[serde(default = "default_download_idle_timeout_secs")]
    pub download_idle_timeout_secs: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for video storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix for uploaded videos
    #[serde(default = "default_key_namespace")]
    pub key_namespace: String,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Per-operation timeout in seconds
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// How completed uploads are handed to downstream processing
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Produce a job message onto a Kafka topic
    Queue,
    /// Invoke a remote function for asynchronous execution
    Invoke,
}

/// Dispatch configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Selected strategy
    #[serde(default = "default_dispatch_strategy")]
    pub strategy: DispatchStrategy,
    /// Kafka settings, required for the queue strategy
    pub kafka: Option<KafkaConfig>,
    /// Function endpoint settings, required for the invoke strategy
    pub invoke: Option<InvokeConfig>,
}

/// Kafka producer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Topic receiving processing jobs
    #[serde(default = "default_jobs_topic")]
    pub topic: String,
    /// Client ID reported to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Delivery timeout in seconds
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

/// Remote function invocation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeConfig {
    /// Function endpoint URL
    pub endpoint_url: String,
    /// Optional bearer token sent with each invocation
    pub auth_token: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

/// Admission and worker limits
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    /// Maximum number of submissions processed concurrently
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// How long shutdown waits for in-flight submissions
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Delay before polling again after a transport error
    #[serde(default = "default_poll_error_backoff_secs")]
    pub poll_error_backoff_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "intake-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_source_tag() -> String {
    "telegram_intake".to_string()
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    25
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_download_idle_timeout_secs() -> u64 {
    60
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_namespace() -> String {
    "temp_videos".to_string()
}

fn default_part_size() -> usize {
    MIN_PART_SIZE_BYTES
}

fn default_operation_timeout_secs() -> u64 {
    60
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_dispatch_strategy() -> DispatchStrategy {
    DispatchStrategy::Queue
}

fn default_jobs_topic() -> String {
    "video.processing.jobs".to_string()
}

fn default_client_id() -> String {
    "intake-service".to_string()
}

fn default_delivery_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_shutdown_grace_secs() -> u64 {
    120
}

fn default_poll_error_backoff_secs() -> u64 {
    5
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "intake-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/intake").required(false))
            .add_source(config::File::with_name("/etc/video-intake/intake").required(false))
            // Override with environment variables
            // INTAKE__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("INTAKE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every dependency the pipeline needs is configured
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingRequired("telegram.bot_token".to_string()));
        }
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }
        crate::submission_store::normalize_database_url(&self.database.url)?;

        if self.s3.part_size_bytes < MIN_PART_SIZE_BYTES {
            return Err(ConfigError::InvalidValue {
                key: "s3.part_size_bytes".to_string(),
                message: format!("must be at least {} bytes", MIN_PART_SIZE_BYTES),
            });
        }
        if self.telegram.download_idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "telegram.download_idle_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.intake.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                key: "intake.max_concurrent_tasks".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        match self.dispatch.strategy {
            DispatchStrategy::Queue => match self.dispatch.kafka {
                Some(ref kafka) if !kafka.bootstrap_servers.trim().is_empty() => {}
                _ => {
                    return Err(ConfigError::MissingRequired(
                        "dispatch.kafka.bootstrap_servers".to_string(),
                    ))
                }
            },
            DispatchStrategy::Invoke => match self.dispatch.invoke {
                Some(ref invoke) if !invoke.endpoint_url.trim().is_empty() => {}
                _ => {
                    return Err(ConfigError::MissingRequired(
                        "dispatch.invoke.endpoint_url".to_string(),
                    ))
                }
            },
        }

        Ok(())
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.intake.shutdown_grace_secs)
    }

    /// Longest silence tolerated between two chunks of a file download
    pub fn download_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.telegram.download_idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            source_tag: default_source_tag(),
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            poll_error_backoff_secs: default_poll_error_backoff_secs(),
        }
    }
}
