//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The port used for HTTP healthchecks.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace watched by this operator.
    pub namespace: String,

    /// The interval at which all clusters of the namespace are reconciled, regardless of events.
    #[serde(default = "Config::default_full_reconciliation_interval_ms")]
    pub full_reconciliation_interval_ms: u64,
    /// The maximum duration of a single wait on the platform, e.g. for pods becoming ready.
    #[serde(default = "Config::default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// The interval at which the platform is polled while waiting.
    #[serde(default = "Config::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// The maximum duration to wait for a cluster's lock.
    #[serde(default = "Config::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// The maximum duration to wait for a broker to become safe to restart.
    #[serde(default = "Config::default_roll_deadline_ms")]
    pub roll_deadline_ms: u64,
    /// The initial backoff between roll-safety checks.
    #[serde(default = "Config::default_roll_backoff_ms")]
    pub roll_backoff_ms: u64,
    /// The upper bound of the backoff between roll-safety checks.
    #[serde(default = "Config::default_roll_backoff_max_ms")]
    pub roll_backoff_max_ms: u64,
    /// The timeout of each call to the administrative interface of a managed cluster.
    #[serde(default = "Config::default_admin_timeout_ms")]
    pub admin_timeout_ms: u64,
    /// The maximum number of clusters reconciled at the same time.
    #[serde(default = "Config::default_max_concurrent_reconciliations")]
    pub max_concurrent_reconciliations: usize,
    /// The maximum duration to wait for in-flight reconciliations during shutdown.
    #[serde(default = "Config::default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Whether image-build resources are managed, only supported on some platform variants.
    #[serde(default)]
    pub image_builds_enabled: bool,

    /// The broker image used when a cluster does not specify one.
    #[serde(default = "Config::default_kafka_image")]
    pub default_kafka_image: String,
    /// The Zookeeper image used when a cluster does not specify one.
    #[serde(default = "Config::default_zookeeper_image")]
    pub default_zookeeper_image: String,
    /// The Connect image used when a cluster does not specify one.
    #[serde(default = "Config::default_connect_image")]
    pub default_connect_image: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Self = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values which would stall or spin the operator's timers.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("FULL_RECONCILIATION_INTERVAL_MS", self.full_reconciliation_interval_ms),
            ("OPERATION_TIMEOUT_MS", self.operation_timeout_ms),
            ("POLL_INTERVAL_MS", self.poll_interval_ms),
            ("LOCK_TIMEOUT_MS", self.lock_timeout_ms),
            ("ROLL_DEADLINE_MS", self.roll_deadline_ms),
            ("ROLL_BACKOFF_MS", self.roll_backoff_ms),
            ("ROLL_BACKOFF_MAX_MS", self.roll_backoff_max_ms),
            ("ADMIN_TIMEOUT_MS", self.admin_timeout_ms),
            ("SHUTDOWN_TIMEOUT_MS", self.shutdown_timeout_ms),
        ];
        for (name, value) in durations {
            ensure!(value > 0, "{} must be greater than 0", name);
        }
        ensure!(self.max_concurrent_reconciliations > 0, "MAX_CONCURRENT_RECONCILIATIONS must be greater than 0");
        ensure!(
            self.roll_backoff_ms <= self.roll_backoff_max_ms,
            "ROLL_BACKOFF_MS ({}) must not exceed ROLL_BACKOFF_MAX_MS ({})",
            self.roll_backoff_ms,
            self.roll_backoff_max_ms
        );
        Ok(())
    }

    pub fn full_reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.full_reconciliation_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn roll_deadline(&self) -> Duration {
        Duration::from_millis(self.roll_deadline_ms)
    }

    pub fn roll_backoff(&self) -> Duration {
        Duration::from_millis(self.roll_backoff_ms)
    }

    pub fn roll_backoff_max(&self) -> Duration {
        Duration::from_millis(self.roll_backoff_max_ms)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_full_reconciliation_interval_ms() -> u64 {
        120_000
    }

    fn default_operation_timeout_ms() -> u64 {
        300_000
    }

    fn default_poll_interval_ms() -> u64 {
        1_000
    }

    fn default_lock_timeout_ms() -> u64 {
        10_000
    }

    fn default_roll_deadline_ms() -> u64 {
        600_000
    }

    fn default_roll_backoff_ms() -> u64 {
        1_000
    }

    fn default_roll_backoff_max_ms() -> u64 {
        30_000
    }

    fn default_admin_timeout_ms() -> u64 {
        10_000
    }

    fn default_max_concurrent_reconciliations() -> usize {
        8
    }

    fn default_shutdown_timeout_ms() -> u64 {
        30_000
    }

    fn default_kafka_image() -> String {
        "quay.io/strimzi/kafka:0.38.0-kafka-3.6.0".into()
    }

    fn default_zookeeper_image() -> String {
        "quay.io/strimzi/kafka:0.38.0-kafka-3.6.0".into()
    }

    fn default_connect_image() -> String {
        "quay.io/strimzi/kafka:0.38.0-kafka-3.6.0".into()
    }
}
