//! Ordering guarantees.
//!
//! Records sent to one destination are acknowledged in send order, also
//! when a batch has to be retried.

use super::harness::{test_config, transient, BrokerResponse, MockBroker, ScriptedTransport};
use crate::error::TransportError;
use crate::protocol::BrokerErrorCode;
use crate::{DeliveryHandle, Producer, ProducerConfig, Record};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn offsets(handles: Vec<DeliveryHandle>) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(handles.len());
    for mut handle in handles {
        let ack = handle.wait(WAIT).await.unwrap();
        offsets.push(ack.offset.unwrap());
    }
    offsets
}

#[tokio::test]
async fn acknowledgments_follow_send_order() {
    let transport = ScriptedTransport::new();
    let producer = Producer::with_transport(
        ProducerConfig {
            batch_size: 3,
            ..test_config(vec!["scripted:1".into()])
        },
        transport.clone(),
    )
    .unwrap();

    let handles: Vec<_> = (0..10u8)
        .map(|i| producer.send("ledgerfun", vec![i]).unwrap())
        .collect();
    let ids: Vec<_> = handles.iter().map(|h| h.record_id()).collect();

    assert_eq!(offsets(handles).await, (0..10).collect::<Vec<u64>>());
    assert_eq!(transport.sent_record_ids(), ids);
    assert!(transport.sent().iter().all(|b| b.record_ids.len() <= 3));
}

#[tokio::test]
async fn retried_batch_stays_ahead_of_later_records() {
    let transport = ScriptedTransport::new();
    transport.fail_next_n(transient(), 2);

    let producer = Producer::with_transport(
        ProducerConfig {
            batch_size: 2,
            ..test_config(vec!["scripted:1".into()])
        },
        transport.clone(),
    )
    .unwrap();

    let handles: Vec<_> = (0..6u8)
        .map(|i| producer.send("ledgerfun", vec![i]).unwrap())
        .collect();
    let ids: Vec<_> = handles.iter().map(|h| h.record_id()).collect();

    assert_eq!(offsets(handles).await, (0..6).collect::<Vec<u64>>());

    let sent = transport.sent();
    assert_eq!(sent[0].record_ids, sent[1].record_ids, "first batch retried");
    assert_eq!(sent[1].record_ids, sent[2].record_ids, "first batch retried twice");
    assert_eq!(sent[2].attempt, 3);

    // Ignoring repeats, records reached the transport in send order.
    let mut first_seen = Vec::new();
    for id in transport.sent_record_ids() {
        if !first_seen.contains(&id) {
            first_seen.push(id);
        }
    }
    assert_eq!(first_seen, ids);
}

#[tokio::test]
async fn destinations_are_ordered_independently() {
    let transport = ScriptedTransport::new();
    let producer = Producer::with_transport(
        test_config(vec!["scripted:1".into()]),
        transport.clone(),
    )
    .unwrap();

    let mut a = Vec::new();
    let mut b = Vec::new();
    for i in 0..5u8 {
        a.push(producer.send("alpha", vec![i]).unwrap());
        b.push(
            producer
                .send_record(Record::new("alpha", vec![i]).with_partition(1))
                .unwrap(),
        );
    }

    assert_eq!(offsets(a).await, vec![0, 1, 2, 3, 4]);
    assert_eq!(offsets(b).await, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn broker_sees_payloads_in_order_after_not_leader() {
    let broker = MockBroker::start().await;
    broker.queue_response(BrokerResponse::Error(BrokerErrorCode::NotLeader));

    let producer = Producer::start(ProducerConfig {
        batch_size: 4,
        ..test_config(vec![broker.endpoint()])
    })
    .unwrap();

    let handles: Vec<_> = (0..8u8)
        .map(|i| producer.send("ledgerfun", vec![i]).unwrap())
        .collect();

    let mut last = None;
    for mut handle in handles {
        let ack = handle.wait(WAIT).await.unwrap();
        assert!(ack.offset > last, "offsets must increase in send order");
        last = ack.offset;
    }

    // The rejected batch was not appended, so accepted payloads are exactly
    // the sent ones, in order.
    let accepted: Vec<Vec<u8>> = broker
        .received()
        .into_iter()
        .skip(1)
        .flat_map(|b| b.payloads)
        .collect();
    assert_eq!(accepted, (0..8u8).map(|i| vec![i]).collect::<Vec<_>>());

    producer.close(WAIT).await.unwrap();
}

#[tokio::test]
async fn retry_exhaustion_does_not_reorder_survivors() {
    let transport = ScriptedTransport::new();
    let producer = Producer::with_transport(
        ProducerConfig {
            batch_size: 1,
            max_retries: 0,
            ..test_config(vec!["scripted:1".into()])
        },
        transport.clone(),
    )
    .unwrap();

    transport.fail_next(TransportError::Timeout {
        endpoint: "scripted:1".into(),
        timeout: Duration::from_millis(1),
    });

    let mut first = producer.send("ledgerfun", vec![0]).unwrap();
    let mut second = producer.send("ledgerfun", vec![1]).unwrap();

    assert!(first.wait(WAIT).await.is_err());
    assert_eq!(second.wait(WAIT).await.unwrap().offset, Some(0));
}
