//! Record accumulator.
//!
//! Records are grouped into one FIFO queue per [`Destination`]. A queue
//! yields a [`Batch`] when it is full (by count or bytes), when its oldest
//! record has waited `linger`, or when a flush forces it.
//!
//! Bytes are counted as the records occupy them inside a ProduceFrame, so
//! per-record framing counts against `max_batch_bytes` as well.
//!
//! Only one batch per destination is in flight at a time. A failed batch
//! goes back to the front of its queue, so records of one destination are
//! always sent in enqueue order, retries included.

use crate::error::{ProducerError, ProducerResult};
use crate::record::{Batch, BatchEntry, Destination, Record, RecordId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Thresholds that decide when a queue becomes a batch.
#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    pub batch_size: usize,
    /// Limit on [`Batch::encoded_len`]. A single larger record still forms
    /// a batch of its own.
    pub max_batch_bytes: usize,
    pub linger: Duration,
    /// Records allowed to wait across all queues.
    pub capacity: usize,
}

/// Snapshot of the accumulator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatorStatus {
    pub pending_records: usize,
    pub in_flight_batches: usize,
    pub destinations: usize,
}

struct QueuedEntry {
    entry: BatchEntry,
    enqueued_at: Instant,
}

#[derive(Default)]
struct DestinationQueue {
    pending: VecDeque<QueuedEntry>,
    /// Encoded size of `pending`.
    pending_bytes: usize,
    in_flight: Option<Uuid>,
    /// Set after a failed attempt; the queue is held back until then.
    retry_at: Option<Instant>,
}

impl DestinationQueue {
    fn is_full(&self, config: &AccumulatorConfig) -> bool {
        self.pending.len() >= config.batch_size || self.pending_bytes >= config.max_batch_bytes
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.in_flight.is_some() || self.retry_at.map_or(false, |at| at > now)
    }

    /// When this queue becomes sendable without a flush.
    fn deadline(&self, linger: Duration) -> Option<Instant> {
        if self.in_flight.is_some() {
            return None;
        }
        let front = self.pending.front()?;
        Some(self.retry_at.unwrap_or(front.enqueued_at + linger))
    }

    fn is_ready(&self, now: Instant, force: bool, config: &AccumulatorConfig) -> bool {
        let front = match self.pending.front() {
            Some(front) => front,
            None => return false,
        };
        if self.is_blocked(now) {
            return false;
        }
        force
            || self.is_full(config)
            || self.retry_at.is_some()
            || front.enqueued_at + config.linger <= now
    }

    fn take_batch(&mut self, destination: &Destination, config: &AccumulatorConfig) -> Batch {
        let mut entries = Vec::new();
        let mut bytes = 0;

        while let Some(front) = self.pending.front() {
            let size = front.entry.record.encoded_len();
            if entries.len() >= config.batch_size
                || (!entries.is_empty() && bytes + size > config.max_batch_bytes)
            {
                break;
            }
            if let Some(queued) = self.pending.pop_front() {
                bytes += size;
                entries.push(queued.entry);
            }
        }

        self.pending_bytes = self.pending_bytes.saturating_sub(bytes);
        self.retry_at = None;

        let batch = Batch::new(destination.clone(), entries);
        self.in_flight = Some(batch.batch_id);
        batch
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<Destination, DestinationQueue>,
    /// Where each queued (not in-flight) record sits.
    index: HashMap<RecordId, Destination>,
    pending_records: usize,
    closed: bool,
}

/// Per-destination record queues shared by callers and the sender loop.
pub struct Accumulator {
    config: AccumulatorConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Accumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    pub fn next_record_id(&self) -> RecordId {
        RecordId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue a record. Returns true when its destination now holds a full
    /// batch.
    pub fn append(&self, id: RecordId, record: Record) -> ProducerResult<bool> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(ProducerError::Closed);
        }
        if state.pending_records >= self.config.capacity {
            return Err(ProducerError::QueueFull {
                capacity: self.config.capacity,
            });
        }

        let destination = record.destination().clone();
        let size = record.encoded_len();

        state.index.insert(id, destination.clone());
        state.pending_records += 1;

        let queue = state.queues.entry(destination).or_default();
        queue.pending.push_back(QueuedEntry {
            entry: BatchEntry {
                id,
                record,
                prior_attempts: 0,
            },
            enqueued_at: Instant::now(),
        });
        queue.pending_bytes += size;

        Ok(queue.is_full(&self.config))
    }

    /// Take every batch that may be sent at `now`.
    ///
    /// `force` ignores `linger` but never a retry backoff or an in-flight
    /// batch.
    pub fn ready(&self, now: Instant, force: bool) -> Vec<Batch> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut batches = Vec::new();

        for (destination, queue) in state.queues.iter_mut() {
            if !queue.is_ready(now, force, &self.config) {
                continue;
            }
            let batch = queue.take_batch(destination, &self.config);
            for entry in &batch.entries {
                state.index.remove(&entry.id);
            }
            state.pending_records = state.pending_records.saturating_sub(batch.len());
            batches.push(batch);
        }

        batches
    }

    /// Earliest instant at which some queue becomes ready on its own.
    pub fn next_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        state
            .queues
            .values()
            .filter_map(|q| q.deadline(self.config.linger))
            .min()
    }

    /// Release the destination after its batch resolved.
    pub fn complete(&self, destination: &Destination, batch_id: Uuid) {
        let mut state = self.state.lock();
        let remove = match state.queues.get_mut(destination) {
            Some(queue) if queue.in_flight == Some(batch_id) => {
                queue.in_flight = None;
                queue.pending.is_empty()
            }
            _ => false,
        };
        if remove {
            state.queues.remove(destination);
        }
    }

    /// Put a failed batch back at the front of its queue, held back until
    /// `retry_at`.
    pub fn requeue(&self, batch: Batch, retry_at: Instant) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let attempt = batch.attempt;
        let count = batch.len();
        let bytes = batch.encoded_len();
        let now = Instant::now();

        for entry in &batch.entries {
            state.index.insert(entry.id, batch.destination.clone());
        }
        state.pending_records += count;

        let queue = state.queues.entry(batch.destination).or_default();
        for mut entry in batch.entries.into_iter().rev() {
            entry.prior_attempts = attempt;
            queue.pending.push_front(QueuedEntry {
                entry,
                enqueued_at: now,
            });
        }
        queue.pending_bytes += bytes;
        if queue.in_flight == Some(batch.batch_id) {
            queue.in_flight = None;
        }
        queue.retry_at = Some(retry_at);
    }

    /// Remove a queued record. Returns false if it is in flight or unknown.
    pub fn cancel(&self, id: RecordId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let destination = match state.index.remove(&id) {
            Some(d) => d,
            None => return false,
        };
        let queue = match state.queues.get_mut(&destination) {
            Some(q) => q,
            None => return false,
        };
        let position = match queue.pending.iter().position(|q| q.entry.id == id) {
            Some(p) => p,
            None => return false,
        };

        if let Some(removed) = queue.pending.remove(position) {
            queue.pending_bytes = queue
                .pending_bytes
                .saturating_sub(removed.entry.record.encoded_len());
        }
        if queue.pending.is_empty() {
            queue.retry_at = None;
            if queue.in_flight.is_none() {
                state.queues.remove(&destination);
            }
        }
        state.pending_records = state.pending_records.saturating_sub(1);
        true
    }

    /// Refuse further appends. Queued records still go out.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Remove every queued record, returning their ids in queue order.
    pub fn drain_all(&self) -> Vec<RecordId> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(state.pending_records);

        for queue in state.queues.values_mut() {
            ids.extend(queue.pending.drain(..).map(|q| q.entry.id));
            queue.pending_bytes = 0;
            queue.retry_at = None;
        }
        state.queues.retain(|_, q| q.in_flight.is_some());
        state.index.clear();
        state.pending_records = 0;
        ids
    }

    pub fn status(&self) -> AccumulatorStatus {
        let state = self.state.lock();
        AccumulatorStatus {
            pending_records: state.pending_records,
            in_flight_batches: state
                .queues
                .values()
                .filter(|q| q.in_flight.is_some())
                .count(),
            destinations: state.queues.len(),
        }
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending_records == 0 && state.queues.values().all(|q| q.in_flight.is_none())
    }
}
