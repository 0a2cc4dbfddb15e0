//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Pipeline Tuning
//!
//! - `RATE_LIMIT_CAPACITY` / `RATE_LIMIT_REFILL` / `RATE_LIMIT_PERIOD_MS`: token
//!   bucket size and refill rate (default: 1000 tokens, 1000 per 1000 ms)
//! - `CIRCUIT_BREAKER_FAILURE_THRESHOLD` / `CIRCUIT_BREAKER_COOLDOWN_MS` /
//!   `CIRCUIT_BREAKER_DECAY`: failure score at which the circuit opens, how
//!   long it stays open, and how much a success forgives (default: 20, 2000 ms, 2)
//! - `CIRCUIT_BREAKER_JITTER_MICROS`: upper bound of the random dispatch delay
//!   (default: 1000, 0 disables)
//! - `REQUEST_TIMEOUT_MS` / `HOT_PATH_TIMEOUT_MS`: deadline budgets
//!   (default: 100 ms, 80 ms)

use std::env;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::encoding::BufferPoolConfig;
use crate::encoding::pool::DEFAULT_INITIAL_CAPACITY;
use crate::error::{AppError, AppResult};
use crate::middleware::{CircuitBreakerConfig, RateLimitConfig};
use crate::pipeline::{DEFAULT_SERVER_HEADER, PipelineConfig};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected `json` or `pretty`, got `{other}`")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8080)
    pub port: u16,

    /// Value of the `Server` header stamped on every response
    pub server_header: String,

    // =========================================================================
    // Admission Control
    // =========================================================================
    /// Token bucket capacity (burst size)
    pub rate_limit_capacity: u32,

    /// Tokens credited per refill period
    pub rate_limit_refill: u32,

    /// Refill period
    pub rate_limit_period: Duration,

    // =========================================================================
    // Failure Containment
    // =========================================================================
    /// Failure score at which the circuit opens
    pub circuit_breaker_failure_threshold: u32,

    /// How long the circuit stays open
    pub circuit_breaker_cooldown: Duration,

    /// Score subtracted per successful call
    pub circuit_breaker_decay: u32,

    /// Upper bound of the random delay before each dispatch (zero disables)
    pub circuit_breaker_jitter: Duration,

    // =========================================================================
    // Deadlines
    // =========================================================================
    /// Budget of the generic deadline stage
    pub request_timeout: Duration,

    /// Tighter budget for hot-path endpoints
    pub hot_path_timeout: Duration,

    // =========================================================================
    // Encoding
    // =========================================================================
    /// Buffers that grew past this many bytes are not returned to the pool
    pub buffer_pool_max_capacity: usize,

    /// Maximum idle buffers kept by the pool
    pub buffer_pool_max_idle: usize,

    /// Maximum request body size in bytes (default: 1 MiB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log filter directive (e.g., "info", "highperf_api=debug")
    pub log_level: String,

    /// Log output format
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,

    /// Interval at which pipeline gauges are published
    pub metrics_publish_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a variable cannot be parsed or a
    /// limit is zero.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,
            server_header: env::var("SERVER_HEADER")
                .unwrap_or_else(|_| DEFAULT_SERVER_HEADER.to_string()),

            // Admission control
            rate_limit_capacity: Self::parse_env("RATE_LIMIT_CAPACITY", 1000)?,
            rate_limit_refill: Self::parse_env("RATE_LIMIT_REFILL", 1000)?,
            rate_limit_period: Duration::from_millis(Self::parse_env(
                "RATE_LIMIT_PERIOD_MS",
                1000,
            )?),

            // Failure containment
            circuit_breaker_failure_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                20,
            )?,
            circuit_breaker_cooldown: Duration::from_millis(Self::parse_env(
                "CIRCUIT_BREAKER_COOLDOWN_MS",
                2000,
            )?),
            circuit_breaker_decay: Self::parse_env("CIRCUIT_BREAKER_DECAY", 2)?,
            circuit_breaker_jitter: Duration::from_micros(Self::parse_env(
                "CIRCUIT_BREAKER_JITTER_MICROS",
                1000,
            )?),

            // Deadlines
            request_timeout: Duration::from_millis(Self::parse_env("REQUEST_TIMEOUT_MS", 100)?),
            hot_path_timeout: Duration::from_millis(Self::parse_env("HOT_PATH_TIMEOUT_MS", 80)?),

            // Encoding
            buffer_pool_max_capacity: Self::parse_env("BUFFER_POOL_MAX_CAPACITY", 1024 * 1024)?,
            buffer_pool_max_idle: Self::parse_env("BUFFER_POOL_MAX_IDLE", 256)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
            metrics_publish_interval: Duration::from_secs(Self::parse_env(
                "METRICS_PUBLISH_INTERVAL_SECS",
                5,
            )?),
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        let must_be_positive = [
            ("RATE_LIMIT_CAPACITY", u128::from(self.rate_limit_capacity)),
            ("RATE_LIMIT_REFILL", u128::from(self.rate_limit_refill)),
            ("RATE_LIMIT_PERIOD_MS", self.rate_limit_period.as_millis()),
            (
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                u128::from(self.circuit_breaker_failure_threshold),
            ),
            (
                "CIRCUIT_BREAKER_COOLDOWN_MS",
                self.circuit_breaker_cooldown.as_millis(),
            ),
            ("REQUEST_TIMEOUT_MS", self.request_timeout.as_millis()),
            ("HOT_PATH_TIMEOUT_MS", self.hot_path_timeout.as_millis()),
            (
                "BUFFER_POOL_MAX_CAPACITY",
                self.buffer_pool_max_capacity as u128,
            ),
            ("MAX_REQUEST_BODY_SIZE", self.max_request_body_size as u128),
            (
                "METRICS_PUBLISH_INTERVAL_SECS",
                self.metrics_publish_interval.as_millis(),
            ),
        ];

        for (name, value) in must_be_positive {
            if value == 0 {
                return Err(AppError::ConfigError(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if let Err(e) = EnvFilter::try_new(&self.log_level) {
            return Err(AppError::ConfigError(format!(
                "RUST_LOG ({:?}) is not a valid filter: {e}",
                self.log_level
            )));
        }

        if self.hot_path_timeout > self.request_timeout {
            return Err(AppError::ConfigError(format!(
                "HOT_PATH_TIMEOUT_MS ({:?}) must be <= REQUEST_TIMEOUT_MS ({:?})",
                self.hot_path_timeout, self.request_timeout
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Settings for the request-governance pipeline.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            server_header: self.server_header.clone(),
            rate_limit: RateLimitConfig {
                capacity: self.rate_limit_capacity,
                refill: self.rate_limit_refill,
                period: self.rate_limit_period,
            },
            circuit_breaker: CircuitBreakerConfig::new(
                self.circuit_breaker_failure_threshold,
                self.circuit_breaker_cooldown,
                self.circuit_breaker_decay,
            )
            .with_jitter(self.circuit_breaker_jitter),
            request_timeout: self.request_timeout,
        }
    }

    /// Settings for the response buffer pool.
    pub fn buffer_pool(&self) -> BufferPoolConfig {
        BufferPoolConfig {
            max_capacity: self.buffer_pool_max_capacity,
            max_idle: self.buffer_pool_max_idle,
            initial_capacity: DEFAULT_INITIAL_CAPACITY.min(self.buffer_pool_max_capacity),
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            server_header: DEFAULT_SERVER_HEADER.to_string(),
            // Admission control
            rate_limit_capacity: 1000,
            rate_limit_refill: 1000,
            rate_limit_period: Duration::from_secs(1),
            // Failure containment
            circuit_breaker_failure_threshold: 20,
            circuit_breaker_cooldown: Duration::from_secs(2),
            circuit_breaker_decay: 2,
            circuit_breaker_jitter: Duration::from_micros(1000),
            // Deadlines
            request_timeout: Duration::from_millis(100),
            hot_path_timeout: Duration::from_millis(80),
            // Encoding
            buffer_pool_max_capacity: 1024 * 1024,
            buffer_pool_max_idle: 256,
            max_request_body_size: 1024 * 1024, // 1MB
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
            metrics_publish_interval: Duration::from_secs(5),
        }
    }
}
