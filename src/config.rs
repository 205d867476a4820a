//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and every field has a default, so an empty file (or no
//! file at all) yields a working relay listening on `localhost:8765`.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub breakers: BreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Subscriber endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,

    #[serde(default = "default_health_log_interval_s")]
    pub health_log_interval_s: u64,

    /// Maximum snapshot age accepted for broadcast
    #[serde(default = "default_freshness_ms")]
    pub freshness_ms: u64,

    /// Telemetry age above which health reports `stale_telemetry`
    #[serde(default = "default_stale_telemetry_ms")]
    pub stale_telemetry_ms: u64,

    #[serde(default = "default_max_error_rate_percent")]
    pub max_error_rate_percent: f64,

    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,

    /// Maximum time allowed for an orderly close handshake
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,

    /// Broadcast a synthetic `MOCK_DATA` snapshot while the source is down
    #[serde(default = "default_placeholder_when_disconnected")]
    pub placeholder_when_disconnected: bool,
}

/// A candidate telemetry source address
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SourceAddress {
    pub address: String,

    #[serde(default)]
    pub baud: Option<u32>,
}

/// Telemetry source selection
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Addresses tried in order until one connects
    #[serde(default = "default_source_addresses")]
    pub addresses: Vec<SourceAddress>,
}

/// Reconnect pacing
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_backoff_delay_ms")]
    pub max_backoff_delay_ms: u64,

    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

/// Source monitoring loop and field read bounds
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_failure_backoff_factor")]
    pub failure_backoff_factor: u32,

    #[serde(default = "default_field_timeout_ms")]
    pub field_timeout_ms: u64,

    /// Bound for the expensive reads (channels, home location, modes)
    #[serde(default = "default_slow_field_timeout_ms")]
    pub slow_field_timeout_ms: u64,

    #[serde(default = "default_monitor_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

/// Circuit breaker thresholds
#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    #[serde(default = "default_connection_threshold")]
    pub connection_threshold: u32,

    #[serde(default = "default_connection_reset_timeout_ms")]
    pub connection_reset_timeout_ms: u64,

    #[serde(default = "default_telemetry_threshold")]
    pub telemetry_threshold: u32,

    #[serde(default = "default_telemetry_reset_timeout_ms")]
    pub telemetry_reset_timeout_ms: u64,
}

/// Snapshot history cache
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    #[serde(default = "default_cache_ttl_s")]
    pub ttl_s: u64,

    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,

    #[serde(default = "default_sweep_error_backoff_s")]
    pub sweep_error_backoff_s: u64,

    /// Size factor over `max_size` that triggers emergency eviction on insert
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f64,

    /// Share of entries dropped by an emergency eviction
    #[serde(default = "default_emergency_fraction")]
    pub emergency_fraction: f64,
}

/// Bounded waits used by graceful shutdown
#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_broadcast_stop_timeout_ms")]
    pub broadcast_stop_timeout_ms: u64,

    #[serde(default = "default_client_close_timeout_ms")]
    pub client_close_timeout_ms: u64,

    #[serde(default = "default_server_close_timeout_ms")]
    pub server_close_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 8765 }
fn default_broadcast_interval_ms() -> u64 { 1000 }
fn default_health_log_interval_s() -> u64 { 30 }
fn default_freshness_ms() -> u64 { 10_000 }
fn default_stale_telemetry_ms() -> u64 { 5000 }
fn default_max_error_rate_percent() -> f64 { 10.0 }
fn default_keepalive_interval_ms() -> u64 { 20_000 }
fn default_keepalive_timeout_ms() -> u64 { 20_000 }
fn default_close_timeout_ms() -> u64 { 10_000 }
fn default_subscriber_queue() -> usize { 32 }
fn default_placeholder_when_disconnected() -> bool { true }

fn default_source_addresses() -> Vec<SourceAddress> {
    vec![SourceAddress { address: "sim://local".to_string(), baud: None }]
}

fn default_reconnect_interval_ms() -> u64 { 5000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_backoff_delay_ms() -> u64 { 60_000 }
fn default_jitter_fraction() -> f64 { 0.1 }
fn default_min_delay_ms() -> u64 { 1000 }
fn default_max_retry_attempts() -> u32 { 5 }

fn default_monitor_interval_ms() -> u64 { 1000 }
fn default_heartbeat_timeout_ms() -> u64 { 5000 }
fn default_max_consecutive_failures() -> u32 { 5 }
fn default_failure_backoff_factor() -> u32 { 3 }
fn default_field_timeout_ms() -> u64 { 500 }
fn default_slow_field_timeout_ms() -> u64 { 2000 }
fn default_monitor_stop_timeout_ms() -> u64 { 3000 }

fn default_connection_threshold() -> u32 { 3 }
fn default_connection_reset_timeout_ms() -> u64 { 30_000 }
fn default_telemetry_threshold() -> u32 { 5 }
fn default_telemetry_reset_timeout_ms() -> u64 { 15_000 }

fn default_cache_max_size() -> usize { 100 }
fn default_cache_ttl_s() -> u64 { 300 }
fn default_sweep_interval_s() -> u64 { 30 }
fn default_sweep_error_backoff_s() -> u64 { 60 }
fn default_emergency_threshold() -> f64 { 1.2 }
fn default_emergency_fraction() -> f64 { 0.25 }

fn default_broadcast_stop_timeout_ms() -> u64 { 5000 }
fn default_client_close_timeout_ms() -> u64 { 3000 }
fn default_server_close_timeout_ms() -> u64 { 5000 }

fn default_log_file_prefix() -> String { "telemetry-relay.log".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
            health_log_interval_s: default_health_log_interval_s(),
            freshness_ms: default_freshness_ms(),
            stale_telemetry_ms: default_stale_telemetry_ms(),
            max_error_rate_percent: default_max_error_rate_percent(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            subscriber_queue: default_subscriber_queue(),
            placeholder_when_disconnected: default_placeholder_when_disconnected(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { addresses: default_source_addresses() }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: default_reconnect_interval_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_delay_ms: default_max_backoff_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            min_delay_ms: default_min_delay_ms(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            failure_backoff_factor: default_failure_backoff_factor(),
            field_timeout_ms: default_field_timeout_ms(),
            slow_field_timeout_ms: default_slow_field_timeout_ms(),
            stop_timeout_ms: default_monitor_stop_timeout_ms(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            connection_threshold: default_connection_threshold(),
            connection_reset_timeout_ms: default_connection_reset_timeout_ms(),
            telemetry_threshold: default_telemetry_threshold(),
            telemetry_reset_timeout_ms: default_telemetry_reset_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_s: default_cache_ttl_s(),
            sweep_interval_s: default_sweep_interval_s(),
            sweep_error_backoff_s: default_sweep_error_backoff_s(),
            emergency_threshold: default_emergency_threshold(),
            emergency_fraction: default_emergency_fraction(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            broadcast_stop_timeout_ms: default_broadcast_stop_timeout_ms(),
            client_close_timeout_ms: default_client_close_timeout_ms(),
            server_close_timeout_ms: default_server_close_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { dir: None, file_prefix: default_log_file_prefix() }
    }
}

impl ServerConfig {
    pub fn broadcast_interval(&self) -> Duration { Duration::from_millis(self.broadcast_interval_ms) }
    pub fn health_log_interval(&self) -> Duration { Duration::from_secs(self.health_log_interval_s) }
    pub fn freshness(&self) -> Duration { Duration::from_millis(self.freshness_ms) }
    pub fn stale_telemetry(&self) -> Duration { Duration::from_millis(self.stale_telemetry_ms) }
    pub fn keepalive_interval(&self) -> Duration { Duration::from_millis(self.keepalive_interval_ms) }
    pub fn keepalive_timeout(&self) -> Duration { Duration::from_millis(self.keepalive_timeout_ms) }
    pub fn close_timeout(&self) -> Duration { Duration::from_millis(self.close_timeout_ms) }
}

impl RetryConfig {
    pub fn reconnect_interval(&self) -> Duration { Duration::from_millis(self.reconnect_interval_ms) }
    pub fn max_backoff_delay(&self) -> Duration { Duration::from_millis(self.max_backoff_delay_ms) }
    pub fn min_delay(&self) -> Duration { Duration::from_millis(self.min_delay_ms) }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration { Duration::from_millis(self.interval_ms) }
    pub fn heartbeat_timeout(&self) -> Duration { Duration::from_millis(self.heartbeat_timeout_ms) }
    pub fn field_timeout(&self) -> Duration { Duration::from_millis(self.field_timeout_ms) }
    pub fn slow_field_timeout(&self) -> Duration { Duration::from_millis(self.slow_field_timeout_ms) }
    pub fn stop_timeout(&self) -> Duration { Duration::from_millis(self.stop_timeout_ms) }
}

impl BreakerConfig {
    pub fn connection_reset_timeout(&self) -> Duration { Duration::from_millis(self.connection_reset_timeout_ms) }
    pub fn telemetry_reset_timeout(&self) -> Duration { Duration::from_millis(self.telemetry_reset_timeout_ms) }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration { Duration::from_secs(self.ttl_s) }
    pub fn sweep_interval(&self) -> Duration { Duration::from_secs(self.sweep_interval_s) }
    pub fn sweep_error_backoff(&self) -> Duration { Duration::from_secs(self.sweep_error_backoff_s) }
}

impl ShutdownConfig {
    pub fn broadcast_stop_timeout(&self) -> Duration { Duration::from_millis(self.broadcast_stop_timeout_ms) }
    pub fn client_close_timeout(&self) -> Duration { Duration::from_millis(self.client_close_timeout_ms) }
    pub fn server_close_timeout(&self) -> Duration { Duration::from_millis(self.server_close_timeout_ms) }
}

fn invalid(msg: impl std::fmt::Display) -> RelayError {
    RelayError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_relay::config::Config;
    ///
    /// let config = Config::load("config/relay.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(invalid("server host cannot be empty"));
        }

        for (name, value, max) in [
            ("broadcast_interval_ms", self.server.broadcast_interval_ms, 60_000),
            ("freshness_ms", self.server.freshness_ms, 600_000),
            ("stale_telemetry_ms", self.server.stale_telemetry_ms, 600_000),
            ("keepalive_interval_ms", self.server.keepalive_interval_ms, 600_000),
            ("keepalive_timeout_ms", self.server.keepalive_timeout_ms, 600_000),
            ("close_timeout_ms", self.server.close_timeout_ms, 60_000),
            ("monitor interval_ms", self.monitor.interval_ms, 60_000),
            ("heartbeat_timeout_ms", self.monitor.heartbeat_timeout_ms, 600_000),
            ("field_timeout_ms", self.monitor.field_timeout_ms, 60_000),
            ("slow_field_timeout_ms", self.monitor.slow_field_timeout_ms, 60_000),
            ("reconnect_interval_ms", self.retry.reconnect_interval_ms, 600_000),
            ("min_delay_ms", self.retry.min_delay_ms, 600_000),
        ] {
            if value == 0 || value > max {
                return Err(invalid(format!("{} must be between 1 and {}", name, max)));
            }
        }

        if self.server.health_log_interval_s == 0 {
            return Err(invalid("health_log_interval_s must be greater than 0"));
        }

        if self.server.subscriber_queue == 0 {
            return Err(invalid("subscriber_queue must be greater than 0"));
        }

        if !(0.0..=100.0).contains(&self.server.max_error_rate_percent) {
            return Err(invalid("max_error_rate_percent must be between 0 and 100"));
        }

        if self.source.addresses.iter().any(|a| a.address.is_empty()) {
            return Err(invalid("source addresses cannot be empty strings"));
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("backoff_multiplier must be at least 1.0"));
        }

        if !(0.0..1.0).contains(&self.retry.jitter_fraction) {
            return Err(invalid("jitter_fraction must be in [0.0, 1.0)"));
        }

        if self.retry.max_backoff_delay_ms < self.retry.min_delay_ms {
            return Err(invalid("max_backoff_delay_ms must not be below min_delay_ms"));
        }

        if self.retry.max_retry_attempts == 0 {
            return Err(invalid("max_retry_attempts must be greater than 0"));
        }

        if self.monitor.max_consecutive_failures == 0 {
            return Err(invalid("max_consecutive_failures must be greater than 0"));
        }

        if self.monitor.failure_backoff_factor == 0 {
            return Err(invalid("failure_backoff_factor must be greater than 0"));
        }

        if self.breakers.connection_threshold == 0 || self.breakers.telemetry_threshold == 0 {
            return Err(invalid("breaker thresholds must be greater than 0"));
        }

        if self.breakers.connection_reset_timeout_ms == 0 || self.breakers.telemetry_reset_timeout_ms == 0 {
            return Err(invalid("breaker reset timeouts must be greater than 0"));
        }

        if self.cache.max_size == 0 {
            return Err(invalid("cache max_size must be greater than 0"));
        }

        if self.cache.ttl_s == 0 || self.cache.sweep_interval_s == 0 || self.cache.sweep_error_backoff_s == 0 {
            return Err(invalid("cache ttl_s, sweep_interval_s and sweep_error_backoff_s must be greater than 0"));
        }

        if self.cache.emergency_threshold < 1.0 {
            return Err(invalid("emergency_threshold must be at least 1.0"));
        }

        if self.cache.emergency_fraction <= 0.0 || self.cache.emergency_fraction > 1.0 {
            return Err(invalid("emergency_fraction must be in (0.0, 1.0]"));
        }

        if self.logging.file_prefix.is_empty() {
            return Err(invalid("logging file_prefix cannot be empty"));
        }

        Ok(())
    }
}
