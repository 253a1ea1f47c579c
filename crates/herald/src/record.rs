//! Records, destinations and batches.

use crate::protocol::RECORD_OVERHEAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier assigned to a record when it is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordering scope: records with equal destinations are delivered in
/// enqueue order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub topic: String,
    /// `None` lets the broker pick the partition.
    pub partition: Option<u32>,
}

impl Destination {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
        }
    }

    pub fn with_partition(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition: Some(partition),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            Some(p) => write!(f, "{}/{}", self.topic, p),
            None => write!(f, "{}/*", self.topic),
        }
    }
}

/// A single outbound message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    destination: Destination,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl Record {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            destination: Destination::new(topic),
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    /// Pin the record to a partition.
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.destination.partition = Some(partition);
        self
    }

    /// Build a record with an explicit creation time.
    pub fn at(
        destination: Destination,
        payload: impl Into<Vec<u8>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            destination,
            payload: payload.into(),
            created_at,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn topic(&self) -> &str {
        &self.destination.topic
    }

    pub fn partition(&self) -> Option<u32> {
        self.destination.partition
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes this record occupies inside a ProduceFrame.
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload.len()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A record inside a batch, with the number of attempts it already went
/// through.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub id: RecordId,
    pub record: Record,
    /// Failed attempts before the current one.
    pub prior_attempts: u32,
}

/// Ordered records for one destination, sent as a unit.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: Uuid,
    pub destination: Destination,
    pub entries: Vec<BatchEntry>,
    /// 1-based attempt number of this send.
    pub attempt: u32,
}

impl Batch {
    pub(crate) fn new(destination: Destination, entries: Vec<BatchEntry>) -> Self {
        let attempt = entries
            .iter()
            .map(|e| e.prior_attempts)
            .max()
            .unwrap_or(0)
            + 1;

        Self {
            batch_id: Uuid::new_v4(),
            destination,
            entries,
            attempt,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record_ids(&self) -> Vec<RecordId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn payload_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.record.payload().len()).sum()
    }

    /// Size of the record section of this batch's frame.
    pub fn encoded_len(&self) -> usize {
        self.entries.iter().map(|e| e.record.encoded_len()).sum()
    }
}

/// Broker's answer for a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchAck {
    /// Offset of the first record; `None` when acks are disabled.
    pub base_offset: Option<u64>,
}

/// Successful delivery of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    pub record_id: RecordId,
    pub destination: Destination,
    /// Broker-assigned offset; `None` when acks are disabled.
    pub offset: Option<u64>,
    pub batch_id: Uuid,
    /// Attempt on which the batch was accepted.
    pub attempts: u32,
}
