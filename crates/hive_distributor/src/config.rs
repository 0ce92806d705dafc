//! Distributor configuration.

use std::path::Path;
use std::time::Duration;

use hive_retry::{RetryError, RetryPolicyBuilder, RetryStrategy};
use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::source::ConfigurationSource;

/// Configuration keys read by [`DistributorConfig::from_source`].
pub mod keys {
    pub const HOST: &str = "net.host";
    pub const PORT: &str = "net.port";
    pub const RETRY_ATTEMPTS: &str = "net.retry.attempts";
    pub const RETRY_DELAY: &str = "net.retry.delay";
    pub const RETRY_MAX_DELAY: &str = "net.retry.max.delay";
    pub const RETRY_USE_EXPONENTIAL: &str = "net.retry.use.exp";
    pub const TCP_NO_DELAY: &str = "net.tcp.nodelay";
    pub const KEEP_ALIVE: &str = "net.keep.alive";
    pub const ACCEPT_BACKLOG: &str = "net.accept.backlog";
    pub const REUSE_ADDRESS: &str = "net.reuse.address";
    pub const CONNECTION_TIMEOUT: &str = "net.connection.timeout";
    pub const HANDSHAKE_TIMEOUT: &str = "net.handshake.timeout";
    pub const VERBOSE_LOGGING: &str = "net.verbose.logging";
    pub const MAX_PENDING: &str = "net.pending.max";
    pub const MAX_FRAME: &str = "net.frame.max";
    pub const SHUTDOWN_TIMEOUT: &str = "net.shutdown.timeout";
}

/// Configuration for one distributor node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Host to listen on; also the advertised address when it resolves.
    pub host: String,
    /// Port to listen on. `0` picks an ephemeral port.
    pub port: u16,

    /// `< 0` retries forever, `0` never retries.
    pub retry_attempts: i64,
    pub retry_delay_ms: i64,
    /// `<= 0` leaves the delay unbounded.
    pub retry_max_delay_ms: i64,
    pub retry_use_exponential: bool,

    pub tcp_no_delay: bool,
    pub keep_alive: bool,
    pub accept_backlog: u32,
    pub reuse_address: bool,

    /// Bound on a single dial attempt. Zero disables the timer.
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,
    /// Zero disables the handshake timer.
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,
    /// How long shutdown waits for socket tasks to finish.
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Trace every frame in and out.
    pub verbose_logging: bool,

    /// Messages buffered per disconnected peer before `send` refuses.
    pub max_pending_messages: usize,
    pub max_frame_length: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1907,
            retry_attempts: 5,
            retry_delay_ms: 1_000,
            retry_max_delay_ms: 32_000,
            retry_use_exponential: true,
            tcp_no_delay: true,
            keep_alive: true,
            accept_backlog: 100,
            reuse_address: true,
            connection_timeout: Duration::from_millis(5_000),
            handshake_timeout: Duration::from_millis(5_000),
            shutdown_timeout: Duration::from_millis(5_000),
            verbose_logging: false,
            max_pending_messages: 10_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl DistributorConfig {
    /// Read every `net.*` key, using the defaults for absent keys.
    pub fn from_source(source: &dyn ConfigurationSource) -> Self {
        let d = Self::default();
        Self {
            host: source.get_string(keys::HOST, &d.host),
            port: u16::try_from(source.get_u64(keys::PORT, u64::from(d.port))).unwrap_or(d.port),
            retry_attempts: source.get_i64(keys::RETRY_ATTEMPTS, d.retry_attempts),
            retry_delay_ms: source.get_i64(keys::RETRY_DELAY, d.retry_delay_ms),
            retry_max_delay_ms: source.get_i64(keys::RETRY_MAX_DELAY, d.retry_max_delay_ms),
            retry_use_exponential: source
                .get_bool(keys::RETRY_USE_EXPONENTIAL, d.retry_use_exponential),
            tcp_no_delay: source.get_bool(keys::TCP_NO_DELAY, d.tcp_no_delay),
            keep_alive: source.get_bool(keys::KEEP_ALIVE, d.keep_alive),
            accept_backlog: u32::try_from(
                source.get_u64(keys::ACCEPT_BACKLOG, u64::from(d.accept_backlog)),
            )
            .unwrap_or(d.accept_backlog),
            reuse_address: source.get_bool(keys::REUSE_ADDRESS, d.reuse_address),
            connection_timeout: millis_or(source, keys::CONNECTION_TIMEOUT, d.connection_timeout),
            handshake_timeout: millis_or(source, keys::HANDSHAKE_TIMEOUT, d.handshake_timeout),
            shutdown_timeout: millis_or(source, keys::SHUTDOWN_TIMEOUT, d.shutdown_timeout),
            verbose_logging: source.get_bool(keys::VERBOSE_LOGGING, d.verbose_logging),
            max_pending_messages: usize::try_from(
                source.get_u64(keys::MAX_PENDING, d.max_pending_messages as u64),
            )
            .unwrap_or(d.max_pending_messages),
            max_frame_length: usize::try_from(
                source.get_u64(keys::MAX_FRAME, d.max_frame_length as u64),
            )
            .unwrap_or(d.max_frame_length),
        }
    }

    /// Build the reconnect policy for one dial sequence.
    pub fn retry_policy(&self) -> Result<RetryStrategy, RetryError> {
        self.retry_builder().build()
    }

    pub fn retry_builder(&self) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(
            self.retry_attempts,
            self.retry_delay_ms,
            self.retry_max_delay_ms,
            self.retry_use_exponential,
        )
    }

    pub fn connection_timer(&self) -> Option<Duration> {
        non_zero(self.connection_timeout)
    }

    pub fn handshake_timer(&self) -> Option<Duration> {
        non_zero(self.handshake_timeout)
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<DistributorConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

fn millis_or(source: &dyn ConfigurationSource, key: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(source.get_u64(key, default_ms))
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(dur.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryConfigurationSource;

    #[test]
    fn test_default_config() {
        let config = DistributorConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1907);
        assert_eq!(config.retry_attempts, 5);
        assert_eq!(config.retry_delay_ms, 1_000);
        assert_eq!(config.retry_max_delay_ms, 32_000);
        assert!(config.retry_use_exponential);
        assert!(config.tcp_no_delay && config.keep_alive && config.reuse_address);
        assert_eq!(config.accept_backlog, 100);
        assert_eq!(config.handshake_timer(), Some(Duration::from_secs(5)));
        assert!(!config.verbose_logging);
    }

    #[test]
    fn test_from_empty_source_is_default() {
        let source = InMemoryConfigurationSource::new();
        assert_eq!(
            DistributorConfig::from_source(&source),
            DistributorConfig::default()
        );
    }

    #[test]
    fn test_from_source_overrides() {
        let source = InMemoryConfigurationSource::from_pairs([
            (keys::HOST, "10.1.1.1"),
            (keys::PORT, "4000"),
            (keys::RETRY_ATTEMPTS, "-1"),
            (keys::RETRY_DELAY, "250"),
            (keys::RETRY_USE_EXPONENTIAL, "false"),
            (keys::HANDSHAKE_TIMEOUT, "0"),
            (keys::VERBOSE_LOGGING, "true"),
            (keys::MAX_PENDING, "12"),
        ]);
        let config = DistributorConfig::from_source(&source);
        assert_eq!(config.host, "10.1.1.1");
        assert_eq!(config.port, 4000);
        assert_eq!(config.retry_attempts, -1);
        assert_eq!(config.retry_delay_ms, 250);
        assert!(!config.retry_use_exponential);
        assert_eq!(config.handshake_timer(), None);
        assert!(config.verbose_logging);
        assert_eq!(config.max_pending_messages, 12);
    }

    #[test]
    fn test_out_of_range_port_keeps_default() {
        let source = InMemoryConfigurationSource::from_pairs([(keys::PORT, "99999")]);
        assert_eq!(DistributorConfig::from_source(&source).port, 1907);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let mut config = DistributorConfig::default();
        assert!(matches!(config.retry_policy(), Ok(RetryStrategy::NTimes(_))));

        config.retry_attempts = -1;
        assert!(matches!(config.retry_policy(), Ok(RetryStrategy::Forever(_))));

        config.retry_delay_ms = 0;
        assert_eq!(
            config.retry_policy().unwrap_err(),
            RetryError::InvalidExponentialDelay(0)
        );
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("distributor.json");

        let mut original = DistributorConfig::default();
        original.port = 4242;
        original.handshake_timeout = Duration::from_millis(750);
        original.save_to_file(&path).unwrap();

        let loaded = DistributorConfig::load_or_default(&path);
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(DistributorConfig::default()).unwrap();
        assert_eq!(json["connection_timeout"], 5_000);
        assert_eq!(json["port"], 1907);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"port": 5000}"#).unwrap();

        let loaded = DistributorConfig::load_or_default(&path);
        assert_eq!(loaded.port, 5000);
        assert_eq!(loaded.host, "localhost");
    }

    #[test]
    fn test_corrupt_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(
            DistributorConfig::load_or_default(&path),
            DistributorConfig::default()
        );
    }
}
