//! Error types for Herald.

use crate::protocol::BrokerErrorCode;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`Transport`](crate::Transport) for a single send.
///
/// Variants carry rendered reasons instead of source errors so one failure
/// can be handed to every record of the batch it belongs to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No acknowledgment within the request timeout
    #[error("Request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    /// Could not establish a connection
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// Established connection failed mid-request
    #[error("Connection to {endpoint} reset: {reason}")]
    ConnectionReset { endpoint: String, reason: String },

    /// Broker answered with an error code
    #[error("Broker rejected batch ({code}): {message}")]
    Broker {
        code: BrokerErrorCode,
        message: String,
    },

    /// Malformed or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Batch cannot be expressed as a frame; nothing was written
    #[error("Failed to encode batch: {0}")]
    Encode(String),
}

impl TransportError {
    /// Whether a later attempt of the same batch may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout { .. }
            | TransportError::Connect { .. }
            | TransportError::ConnectionReset { .. } => true,
            TransportError::Broker { code, .. } => code.is_retryable(),
            TransportError::Protocol(_) | TransportError::Encode(_) => false,
        }
    }

    /// Whether the connection that produced this error must be discarded.
    ///
    /// After a timeout a late acknowledgment may still arrive and would be
    /// read as the answer to the next request.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::ConnectionReset { .. }
                | TransportError::Protocol(_)
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Invalid producer configuration. Raised before anything starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Broker list is empty
    #[error("No broker endpoints configured")]
    NoBrokers,

    /// Broker entry could not be parsed as `host[:port]`
    #[error("Invalid broker endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Field out of range or unparsable
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// IO error reading a config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error parsing a config file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for configuration loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Outcome observed through a [`DeliveryHandle`](crate::DeliveryHandle)
/// when a record is not acknowledged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Non-retryable transport failure
    #[error("Delivery failed: {0}")]
    Fatal(TransportError),

    /// Transient failures persisted past the retry bound
    #[error("Delivery failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: TransportError,
    },

    /// Cancelled by the caller before it was sent
    #[error("Record cancelled before send")]
    Cancelled,

    /// Producer stopped before the record was resolved
    #[error("Producer shut down before delivery")]
    Shutdown,

    /// `wait` elapsed; the record is still pending
    #[error("No outcome within {0:?}")]
    Timeout(Duration),

    /// Terminal outcome was already returned by this handle
    #[error("Delivery outcome already observed")]
    AlreadyObserved,
}

impl DeliveryError {
    /// Whether this describes the record's final state (as opposed to a
    /// wait that gave up early).
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            DeliveryError::Timeout(_) | DeliveryError::AlreadyObserved
        )
    }
}

/// Errors returned synchronously by [`Producer`](crate::Producer) calls.
#[derive(Error, Debug)]
pub enum ProducerError {
    /// Configuration rejected at startup
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Too many records waiting to be sent
    #[error("Producer queue full ({capacity} records pending)")]
    QueueFull { capacity: usize },

    /// Producer is closing or closed
    #[error("Producer is closed")]
    Closed,

    /// Some broker endpoints could not be reached
    #[error("Brokers not reachable: {}", unreachable.join(", "))]
    NotReady { unreachable: Vec<String> },

    /// `flush` did not drain the queue in time
    #[error("Flush did not complete within {0:?}")]
    FlushTimeout(Duration),
}

/// Result type for producer operations.
pub type ProducerResult<T> = Result<T, ProducerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> TransportError {
        TransportError::Timeout {
            endpoint: "localhost:9092".to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(timeout().is_transient());
        assert!(TransportError::Connect {
            endpoint: "b:1".into(),
            reason: "refused".into()
        }
        .is_transient());
        assert!(TransportError::ConnectionReset {
            endpoint: "b:1".into(),
            reason: "eof".into()
        }
        .is_transient());
        assert!(TransportError::Broker {
            code: BrokerErrorCode::NotLeader,
            message: String::new()
        }
        .is_transient());
        assert!(TransportError::Broker {
            code: BrokerErrorCode::Throttled,
            message: String::new()
        }
        .is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!TransportError::Protocol("bad frame".into()).is_transient());
        for code in [
            BrokerErrorCode::UnknownTopic,
            BrokerErrorCode::AuthenticationFailed,
            BrokerErrorCode::RecordTooLarge,
            BrokerErrorCode::Unknown(99),
        ] {
            let err = TransportError::Broker {
                code,
                message: String::new(),
            };
            assert!(!err.is_transient(), "{code} should be fatal");
        }
    }

    #[test]
    fn test_broker_errors_keep_connection() {
        let err = TransportError::Broker {
            code: BrokerErrorCode::NotLeader,
            message: String::new(),
        };
        assert!(!err.poisons_connection());
        assert!(timeout().poisons_connection());
    }

    #[test]
    fn test_encode_failure_is_fatal_but_keeps_connection() {
        let err = TransportError::Encode("topic too long".into());
        assert!(!err.is_transient());
        assert!(!err.poisons_connection());
        assert!(TransportError::Protocol("bad ack".into()).poisons_connection());
    }

    #[test]
    fn test_delivery_error_terminality() {
        assert!(DeliveryError::Cancelled.is_terminal());
        assert!(DeliveryError::Shutdown.is_terminal());
        assert!(DeliveryError::Fatal(timeout()).is_terminal());
        assert!(!DeliveryError::Timeout(Duration::from_millis(5)).is_terminal());
        assert!(!DeliveryError::AlreadyObserved.is_terminal());
    }

    #[test]
    fn test_not_ready_message_lists_endpoints() {
        let err = ProducerError::NotReady {
            unreachable: vec!["a:1".into(), "b:2".into()],
        };
        assert_eq!(err.to_string(), "Brokers not reachable: a:1, b:2");
    }
}
