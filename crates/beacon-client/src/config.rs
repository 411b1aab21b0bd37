//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BEACON_*)
//! - TOML configuration file
//!
//! Every period, TTL and timeout is stored in milliseconds and exposed as a
//! `Duration` through an accessor.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server endpoints.
    #[serde(default)]
    pub server: ServerConfig,

    /// Connection manager settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Heartbeat driver settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Presence polling settings.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Typing indicator settings.
    #[serde(default)]
    pub typing: TypingConfig,

    /// Delivery tracking settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint for the persistent channel.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Base URL of the HTTP API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Path of the presence-refresh endpoint.
    #[serde(default = "default_heartbeat_path")]
    pub heartbeat_path: String,

    /// Path of the users-listing endpoint.
    #[serde(default = "default_users_path")]
    pub users_path: String,
}

/// Connection manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Timeout for opening the channel, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Backoff before the first reconnect attempt, in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff growth factor per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Backoff ceiling, in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Fraction of each delay that may be randomly shaved off (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Failed attempts before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Capacity of the outbound queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Keep-alive ping period, in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Consecutive unanswered pings before the channel is considered dead.
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
}

/// Heartbeat driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Timeout for one heartbeat request, in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// Presence polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Roster poll period in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Timeout for one roster request, in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Age after which an unobserved user is demoted to offline. 0 disables.
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,

    /// How long a fetched roster is served from cache, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub cache_ttl_ms: u64,
}

/// Typing indicator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Lifetime of a typing signal, in milliseconds.
    #[serde(default = "default_typing_ttl")]
    pub ttl_ms: u64,

    /// Expiry sweep period, in milliseconds. Clamped to half the TTL.
    #[serde(default = "default_typing_sweep")]
    pub sweep_interval_ms: u64,
}

/// Delivery tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Time to wait for an acknowledgment, in milliseconds.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Timeout sweep period, in milliseconds.
    #[serde(default = "default_delivery_sweep")]
    pub sweep_interval_ms: u64,

    /// How long settled records stay queryable, in milliseconds.
    #[serde(default = "default_delivery_retention")]
    pub retention_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_ws_url() -> String {
    std::env::var("BEACON_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string())
}

fn default_api_base_url() -> String {
    std::env::var("BEACON_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string())
}

fn default_heartbeat_path() -> String {
    "/api/users/heartbeat".to_string()
}

fn default_users_path() -> String {
    "/api/users".to_string()
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    30_000 // 30 seconds
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_queue_capacity() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    15_000 // 15 seconds
}

fn default_max_missed_pongs() -> u32 {
    3
}

fn default_heartbeat_interval() -> u64 {
    10_000 // 10 seconds
}

fn default_request_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_poll_interval() -> u64 {
    5_000 // 5 seconds
}

fn default_stale_after() -> u64 {
    60_000 // 60 seconds
}

fn default_typing_ttl() -> u64 {
    5_000 // 5 seconds
}

fn default_typing_sweep() -> u64 {
    1_000
}

fn default_ack_timeout() -> u64 {
    15_000 // 15 seconds
}

fn default_delivery_sweep() -> u64 {
    1_000
}

fn default_delivery_retention() -> u64 {
    300_000 // 5 minutes
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_base_url: default_api_base_url(),
            heartbeat_path: default_heartbeat_path(),
            users_path: default_users_path(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            queue_capacity: default_queue_capacity(),
            ping_interval_ms: default_ping_interval(),
            max_missed_pongs: default_max_missed_pongs(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            request_timeout_ms: default_request_timeout(),
            stale_after_ms: default_stale_after(),
            cache_ttl_ms: default_poll_interval(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_typing_ttl(),
            sweep_interval_ms: default_typing_sweep(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            sweep_interval_ms: default_delivery_sweep(),
            retention_ms: default_delivery_retention(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl PresenceConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `None` when stale expiry is disabled.
    #[must_use]
    pub fn stale_after(&self) -> Option<Duration> {
        (self.stale_after_ms > 0).then(|| Duration::from_millis(self.stale_after_ms))
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl TypingConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the result fails validation.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "beacon.toml",
            "/etc/beacon/beacon.toml",
            "~/.config/beacon/beacon.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                let mut config = Self::from_file(expanded.as_ref())?;
                config.apply_env_overrides();
                config.validate()?;
                return Ok(config);
            }
        }

        // Fall back to defaults with environment overrides
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Let `BEACON_WS_URL` and `BEACON_API_URL` take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BEACON_WS_URL") {
            self.server.ws_url = url;
        }
        if let Ok(url) = std::env::var("BEACON_API_URL") {
            self.server.api_base_url = url;
        }
    }

    /// Check that the settings describe a runnable client.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        if !(0.0..=1.0).contains(&c.jitter) {
            bail!("connection.jitter must be between 0 and 1, got {}", c.jitter);
        }
        if c.backoff_multiplier < 1.0 {
            bail!(
                "connection.backoff_multiplier must be at least 1, got {}",
                c.backoff_multiplier
            );
        }
        if c.queue_capacity == 0 {
            bail!("connection.queue_capacity must be positive");
        }
        if c.max_missed_pongs == 0 {
            bail!("connection.max_missed_pongs must be positive");
        }

        let periods = [
            ("connection.ping_interval_ms", c.ping_interval_ms),
            ("connection.connect_timeout_ms", c.connect_timeout_ms),
            ("heartbeat.interval_ms", self.heartbeat.interval_ms),
            ("presence.poll_interval_ms", self.presence.poll_interval_ms),
            ("typing.ttl_ms", self.typing.ttl_ms),
            ("typing.sweep_interval_ms", self.typing.sweep_interval_ms),
            ("delivery.ack_timeout_ms", self.delivery.ack_timeout_ms),
            ("delivery.sweep_interval_ms", self.delivery.sweep_interval_ms),
            ("delivery.retention_ms", self.delivery.retention_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, ms)| *ms == 0) {
            bail!("{name} must be positive");
        }

        Ok(())
    }
}
