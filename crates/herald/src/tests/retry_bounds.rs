//! Retry classification and attempt limits.

use super::harness::{fatal, test_config, transient, ScriptedTransport};
use crate::error::{DeliveryError, TransportError};
use crate::protocol::BrokerErrorCode;
use crate::{Producer, ProducerConfig};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config(max_retries: u32) -> ProducerConfig {
    ProducerConfig {
        max_retries,
        ..test_config(vec!["scripted:1".into()])
    }
}

#[tokio::test]
async fn persistent_transient_failure_ends_in_retries_exhausted() {
    let transport = ScriptedTransport::new();
    transport.fail_next_n(transient(), 100);

    let producer = Producer::with_transport(config(2), transport.clone()).unwrap();
    let mut handle = producer.send("ledgerfun", b"ping!".to_vec()).unwrap();

    assert_eq!(
        handle.wait(WAIT).await,
        Err(DeliveryError::RetriesExhausted {
            attempts: 3,
            last_error: transient(),
        })
    );
    assert_eq!(transport.attempt_count(), 3);
    let attempts: Vec<u32> = transport.sent().iter().map(|b| b.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    // No further attempts once the record is terminal.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.attempt_count(), 3);
}

#[tokio::test]
async fn zero_retries_means_single_attempt() {
    let transport = ScriptedTransport::new();
    transport.fail_next(transient());

    let producer = Producer::with_transport(config(0), transport.clone()).unwrap();
    let mut handle = producer.send("ledgerfun", b"ping!".to_vec()).unwrap();

    assert!(matches!(
        handle.wait(WAIT).await,
        Err(DeliveryError::RetriesExhausted { attempts: 1, .. })
    ));
    assert_eq!(transport.attempt_count(), 1);
}

#[tokio::test]
async fn fatal_error_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport.fail_next(fatal());

    let producer = Producer::with_transport(config(5), transport.clone()).unwrap();
    let mut handle = producer.send("ledgerfun", b"ping!".to_vec()).unwrap();

    assert_eq!(handle.wait(WAIT).await, Err(DeliveryError::Fatal(fatal())));
    assert_eq!(transport.attempt_count(), 1);
    assert_eq!(producer.status().retries, 0);
}

#[tokio::test]
async fn recovers_within_bound() {
    let transport = ScriptedTransport::new();
    transport.fail_next_n(transient(), 2);

    let producer = Producer::with_transport(config(2), transport.clone()).unwrap();
    let mut handle = producer.send("ledgerfun", b"ping!".to_vec()).unwrap();

    let ack = handle.wait(WAIT).await.unwrap();
    assert_eq!(ack.attempts, 3);
    assert_eq!(producer.status().retries, 2);
}

#[tokio::test]
async fn throttled_and_not_leader_are_retried() {
    let transport = ScriptedTransport::new();
    for code in [BrokerErrorCode::Throttled, BrokerErrorCode::NotLeader] {
        transport.fail_next(TransportError::Broker {
            code,
            message: String::new(),
        });
    }

    let producer = Producer::with_transport(config(5), transport.clone()).unwrap();
    let mut handle = producer.send("ledgerfun", b"ping!".to_vec()).unwrap();

    assert_eq!(handle.wait(WAIT).await.unwrap().attempts, 3);
}

#[tokio::test]
async fn unknown_broker_code_is_fatal() {
    let transport = ScriptedTransport::new();
    transport.fail_next(TransportError::Broker {
        code: BrokerErrorCode::Unknown(77),
        message: "???".to_string(),
    });

    let producer = Producer::with_transport(config(5), transport.clone()).unwrap();
    let mut handle = producer.send("ledgerfun", b"ping!".to_vec()).unwrap();

    assert!(matches!(
        handle.wait(WAIT).await,
        Err(DeliveryError::Fatal(TransportError::Broker {
            code: BrokerErrorCode::Unknown(77),
            ..
        }))
    ));
}

#[tokio::test]
async fn backoff_delays_retries() {
    let transport = ScriptedTransport::new();
    transport.fail_next_n(transient(), 2);

    let producer = Producer::with_transport(
        ProducerConfig {
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 1_000,
            ..config(5)
        },
        transport.clone(),
    )
    .unwrap();

    let started = tokio::time::Instant::now();
    let mut handle = producer.send("ledgerfun", b"ping!".to_vec()).unwrap();
    handle.wait(WAIT).await.unwrap();

    // 100ms after the first failure plus 200ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(300));
}
