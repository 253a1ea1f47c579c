//! Herald: a durable message producer.
//!
//! Herald queues records per destination, sends them to brokers in
//! batches, retries transient failures with bounded backoff, and reports
//! every record's fate through a [`DeliveryHandle`].
//!
//! # Guarantees
//!
//! 1. **Ordered**: records for one destination are acknowledged in the
//!    order they were sent, across retries
//! 2. **Exactly-once resolution**: each handle resolves to one
//!    acknowledgment or one terminal error
//! 3. **Bounded retries**: a batch is attempted at most `max_retries + 1`
//!    times
//! 4. **Cancellable**: a record not yet on the wire can be withdrawn
//!
//! # Architecture
//!
//! ```text
//! send() -> Accumulator -> sender loop -> Transport -> broker
//!                ^              |               |
//!                |__ requeue ___|<-- RetryGovernor
//!                               |
//!               DeliveryTracker <-- ack / terminal error
//! ```

pub mod accumulator;
pub mod config;
pub mod delivery;
pub mod error;
pub mod producer;
pub mod protocol;
pub mod record;
pub mod retry;
pub mod transport;

#[cfg(test)]
mod tests;

pub use accumulator::{Accumulator, AccumulatorConfig, AccumulatorStatus};
pub use config::{Endpoint, ProducerConfig, RequiredAcks};
pub use delivery::{CancelOutcome, DeliveryHandle, DeliveryOutcome, DeliveryTracker};
pub use error::{
    ConfigError, ConfigResult, DeliveryError, ProducerError, ProducerResult, TransportError,
    TransportResult,
};
pub use producer::{Producer, ProducerStatus};
pub use protocol::{AckFrame, BrokerErrorCode, ProduceFrame};
pub use record::{Acknowledgment, Batch, BatchAck, Destination, Record, RecordId};
pub use retry::{RetryDecision, RetryGovernor, RetryPolicy};
pub use transport::{BrokerClient, ProbeReport, TcpTransport, Transport};
