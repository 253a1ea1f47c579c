//! Integration tests for the Herald producer.
//!
//! - `harness.rs`          - MockBroker (TCP, wire protocol) and ScriptedTransport
//! - `ordering.rs`         - Per-destination acknowledgment order, retries included
//! - `exactly_once.rs`     - Every handle resolves once
//! - `cancellation.rs`     - Withdrawing queued, in-flight and resolved records
//! - `retry_bounds.rs`     - Retry classification and attempt limits
//! - `transport_failure.rs` - Connection loss, timeouts and broker errors over TCP
//! - `lifecycle.rs`        - flush, close, wait_ready, acks disabled

mod ordering;
mod retry_bounds;

#[allow(unused_imports)]
pub use harness::{BrokerResponse, MockBroker, ScriptedTransport};
