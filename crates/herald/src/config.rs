//! Configuration for the producer.

use crate::error::{ConfigError, ConfigResult};
use crate::protocol::MAX_RECORDS_LEN;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Port assumed when a broker entry has none.
pub const DEFAULT_BROKER_PORT: u16 = 9092;

/// Acknowledgment level requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAcks {
    /// Fire and forget: a batch counts as delivered once written.
    None,
    /// Wait for the broker to append the batch.
    #[default]
    Leader,
}

impl RequiredAcks {
    pub fn to_byte(self) -> u8 {
        match self {
            RequiredAcks::None => 0,
            RequiredAcks::Leader => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RequiredAcks::None),
            1 => Some(RequiredAcks::Leader),
            _ => None,
        }
    }
}

impl FromStr for RequiredAcks {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(RequiredAcks::None),
            "1" | "leader" => Ok(RequiredAcks::Leader),
            other => Err(ConfigError::Invalid {
                field: "required_acks",
                reason: format!("expected 0/none or 1/leader, got '{}'", other),
            }),
        }
    }
}

/// A broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Parses `host` or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            endpoint: s.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = s.trim();
        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
                (host, port)
            }
            None => (trimmed, DEFAULT_BROKER_PORT),
        };

        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Endpoint::new(host, port))
    }
}

/// Producer configuration.
///
/// Every field has a default, so a config file only needs the keys it
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Broker endpoints, `host[:port]`.
    pub brokers: Vec<String>,
    /// Name reported in logs.
    pub client_id: String,
    /// Records per batch before a flush is forced.
    pub batch_size: usize,
    /// Encoded record bytes per batch, payloads plus per-record framing.
    /// At most [`MAX_RECORDS_LEN`] so every batch fits one frame.
    pub max_batch_bytes: usize,
    /// How long a record may wait for companions before its batch is sent.
    pub linger_ms: u64,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// First retry delay.
    pub retry_backoff_base_ms: u64,
    /// Cap on the retry delay.
    pub retry_backoff_max_ms: u64,
    /// Fraction of random spread applied to each delay, 0.0..=1.0.
    pub retry_jitter: f64,
    /// Time allowed for one batch to be acknowledged.
    pub request_timeout_ms: u64,
    /// Acknowledgment level.
    pub required_acks: RequiredAcks,
    /// Records allowed to wait in the queue before `send` is refused.
    pub queue_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            brokers: vec![format!("localhost:{}", DEFAULT_BROKER_PORT)],
            client_id: "herald".to_string(),
            batch_size: 100,
            max_batch_bytes: 1024 * 1024,
            linger_ms: 5,
            max_retries: 5,
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 10_000,
            retry_jitter: 0.2,
            request_timeout_ms: 30_000,
            required_acks: RequiredAcks::Leader,
            queue_capacity: 100_000,
        }
    }
}

impl ProducerConfig {
    /// Defaults, overridden from the environment.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.load_from_env()?;
        Ok(config)
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = Self::load_from_file(path)?;
        config.load_from_env()?;
        Ok(config)
    }

    /// Load from a JSON file only.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Apply `HERALD_*` environment variables.
    pub fn load_from_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(brokers) = lookup("HERALD_BROKERS") {
            self.brokers = brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(client_id) = lookup("HERALD_CLIENT_ID") {
            self.client_id = client_id;
        }
        if let Some(acks) = lookup("HERALD_REQUIRED_ACKS") {
            self.required_acks = acks.parse()?;
        }
        if let Some(v) = lookup("HERALD_BATCH_SIZE") {
            self.batch_size = parse_number("batch_size", &v)?;
        }
        if let Some(v) = lookup("HERALD_LINGER_MS") {
            self.linger_ms = parse_number("linger_ms", &v)?;
        }
        if let Some(v) = lookup("HERALD_MAX_RETRIES") {
            self.max_retries = parse_number("max_retries", &v)?;
        }
        if let Some(v) = lookup("HERALD_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_number("request_timeout_ms", &v)?;
        }
        Ok(())
    }

    /// Parsed broker endpoints.
    pub fn endpoints(&self) -> ConfigResult<Vec<Endpoint>> {
        if self.brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }
        self.brokers.iter().map(|b| b.parse()).collect()
    }

    /// Check every field. Called by the producer before it starts.
    pub fn validate(&self) -> ConfigResult<()> {
        self.endpoints()?;

        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.max_batch_bytes == 0 {
            return Err(invalid("max_batch_bytes", "must be at least 1"));
        }
        if self.max_batch_bytes > MAX_RECORDS_LEN {
            return Err(ConfigError::Invalid {
                field: "max_batch_bytes",
                reason: format!(
                    "{} exceeds the {} bytes a frame can carry",
                    self.max_batch_bytes, MAX_RECORDS_LEN
                ),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(invalid("retry_jitter", "must be between 0.0 and 1.0"));
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(invalid(
                "retry_backoff_base_ms",
                "must not exceed retry_backoff_max_ms",
            ));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
            backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
            jitter: self.retry_jitter,
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(field, &format!("'{}' is not a number", value)))
}
