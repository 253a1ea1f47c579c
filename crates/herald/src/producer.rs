//! Producer: the caller-facing entry point.
//!
//! `send` queues a record and returns its [`DeliveryHandle`]. A background
//! sender loop turns ready queues into batches, hands each batch to the
//! [`Transport`] on its own task, and routes the outcome either back into
//! the accumulator (retry) or to the delivery tracker (acknowledged or
//! failed).

use crate::accumulator::{Accumulator, AccumulatorConfig};
use crate::config::{ProducerConfig, RequiredAcks};
use crate::delivery::{CancelOutcome, CancelRecord, DeliveryHandle, DeliveryTracker};
use crate::error::{DeliveryError, ProducerError, ProducerResult};
use crate::record::{Acknowledgment, Batch, Record, RecordId};
use crate::retry::{RetryDecision, RetryGovernor};
use crate::transport::{TcpTransport, Transport};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sleep used by the sender loop when nothing is queued.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Pause between reachability probes in [`Producer::wait_ready`].
const READY_RETRY: Duration = Duration::from_millis(250);

/// Point-in-time view of the producer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerStatus {
    /// Records queued and not yet in a batch.
    pub pending_records: usize,
    /// Batches currently on the wire.
    pub in_flight_batches: usize,
    /// Records whose handle is not resolved yet.
    pub unresolved: usize,
    pub acknowledged: u64,
    pub failed: u64,
    pub retries: u64,
    pub closed: bool,
}

#[derive(Default)]
struct Stats {
    acknowledged: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// State shared between the producer, its handles and the sender loop.
struct Shared {
    accumulator: Accumulator,
    tracker: DeliveryTracker,
    transport: Arc<dyn Transport>,
    governor: RetryGovernor,
    acks: RequiredAcks,
    request_timeout: Duration,
    /// Wakes the sender loop.
    wakeup: Notify,
    /// Signalled whenever a batch resolves or a record is cancelled.
    idle: Notify,
    flushing: AtomicUsize,
    stats: Stats,
}

impl Shared {
    /// Send one batch and route its outcome.
    async fn dispatch(&self, batch: Batch) {
        let result = self
            .transport
            .send(&batch, self.acks, self.request_timeout)
            .await;

        match result {
            Ok(ack) => {
                info!(
                    batch_id = %batch.batch_id,
                    destination = %batch.destination,
                    records = batch.len(),
                    attempt = batch.attempt,
                    base_offset = ?ack.base_offset,
                    "Batch acknowledged"
                );

                for (index, entry) in batch.entries.iter().enumerate() {
                    self.tracker.acknowledge(Acknowledgment {
                        record_id: entry.id,
                        destination: batch.destination.clone(),
                        offset: ack.base_offset.map(|base| base + index as u64),
                        batch_id: batch.batch_id,
                        attempts: batch.attempt,
                    });
                }
                self.stats
                    .acknowledged
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.accumulator.complete(&batch.destination, batch.batch_id);
            }
            Err(transport_error) => match self.governor.decide(&transport_error, batch.attempt) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        batch_id = %batch.batch_id,
                        destination = %batch.destination,
                        attempt = batch.attempt,
                        max_attempts = self.governor.policy().max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %transport_error,
                        "Batch failed, retrying"
                    );
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    self.accumulator.requeue(batch, Instant::now() + delay);
                }
                RetryDecision::Terminal(delivery_error) => {
                    error!(
                        batch_id = %batch.batch_id,
                        destination = %batch.destination,
                        records = batch.len(),
                        attempt = batch.attempt,
                        error = %delivery_error,
                        "Batch failed permanently"
                    );
                    for entry in &batch.entries {
                        self.tracker.fail(entry.id, delivery_error.clone());
                    }
                    self.stats
                        .failed
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.accumulator.complete(&batch.destination, batch.batch_id);
                }
            },
        }

        self.wakeup.notify_one();
        self.idle.notify_waiters();
    }

    /// Resolve once nothing is queued or in flight.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.accumulator.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn force_flush(&self) -> bool {
        self.flushing.load(Ordering::Acquire) > 0 || self.accumulator.is_closed()
    }
}

impl CancelRecord for Shared {
    fn cancel(&self, id: RecordId) -> CancelOutcome {
        if self.accumulator.cancel(id) {
            self.tracker.fail(id, DeliveryError::Cancelled);
            debug!(record_id = %id, "Record cancelled before send");
            self.idle.notify_waiters();
            CancelOutcome::Removed
        } else if self.tracker.is_pending(id) {
            CancelOutcome::InFlight
        } else {
            CancelOutcome::AlreadyResolved
        }
    }
}

/// Decrements the flush counter when a flush ends, even if its future is
/// dropped early.
struct FlushGuard<'a>(&'a AtomicUsize);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Durable message producer.
///
/// Must be created inside a Tokio runtime; the sender loop is spawned on
/// construction. Dropping the producer stops the loop without flushing,
/// use [`close`](Self::close) for an orderly stop.
pub struct Producer {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Producer {
    /// Validate `config` and start a producer over TCP.
    pub fn start(config: ProducerConfig) -> ProducerResult<Self> {
        config.validate()?;
        let transport = TcpTransport::new(config.endpoints()?);
        Self::with_transport(config, Arc::new(transport))
    }

    /// Start a producer over any [`Transport`].
    pub fn with_transport(
        config: ProducerConfig,
        transport: Arc<dyn Transport>,
    ) -> ProducerResult<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            accumulator: Accumulator::new(AccumulatorConfig {
                batch_size: config.batch_size,
                max_batch_bytes: config.max_batch_bytes,
                linger: config.linger(),
                capacity: config.queue_capacity,
            }),
            tracker: DeliveryTracker::new(),
            transport,
            governor: RetryGovernor::new(config.retry_policy()),
            acks: config.required_acks,
            request_timeout: config.request_timeout(),
            wakeup: Notify::new(),
            idle: Notify::new(),
            flushing: AtomicUsize::new(0),
            stats: Stats::default(),
        });

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_sender(shared.clone(), shutdown.clone()));

        info!(
            client_id = %config.client_id,
            brokers = ?config.brokers,
            acks = ?config.required_acks,
            batch_size = config.batch_size,
            linger_ms = config.linger_ms,
            max_retries = config.max_retries,
            "Producer started"
        );

        Ok(Self {
            shared,
            shutdown,
            worker: Some(worker),
        })
    }

    /// Probe the brokers until all are reachable or `timeout` elapses.
    /// A transport that reports no endpoints is never ready.
    pub async fn wait_ready(&self, timeout: Duration) -> ProducerResult<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reports = self
                .shared
                .transport
                .probe(remaining.max(Duration::from_millis(10)))
                .await;

            let reported = !reports.is_empty();
            let unreachable: Vec<String> = reports
                .into_iter()
                .filter(|r| !r.reachable)
                .map(|r| r.endpoint)
                .collect();

            if reported && unreachable.is_empty() {
                info!("Brokers reachable");
                return Ok(());
            }

            if Instant::now() + READY_RETRY >= deadline {
                return Err(ProducerError::NotReady { unreachable });
            }

            debug!(unreachable = ?unreachable, "Waiting for brokers");
            tokio::time::sleep(READY_RETRY).await;
        }
    }

    /// Queue `payload` for `topic`; the broker picks the partition.
    pub fn send(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> ProducerResult<DeliveryHandle> {
        self.send_record(Record::new(topic, payload))
    }

    /// Queue a record.
    ///
    /// Fails with [`ProducerError::QueueFull`] when too many records are
    /// waiting and with [`ProducerError::Closed`] after `close` began.
    pub fn send_record(&self, record: Record) -> ProducerResult<DeliveryHandle> {
        let shared = &self.shared;
        let id = shared.accumulator.next_record_id();
        let destination = record.destination().clone();

        // Registered first so an acknowledgment can never beat it.
        let receiver = shared.tracker.register(id);
        if let Err(e) = shared.accumulator.append(id, record) {
            shared.tracker.forget(id);
            return Err(e);
        }
        shared.wakeup.notify_one();

        let canceller: Arc<dyn CancelRecord> = shared.clone();
        Ok(DeliveryHandle::new(id, destination, receiver, canceller))
    }

    /// Send everything queued now and wait until it has resolved.
    pub async fn flush(&self, timeout: Duration) -> ProducerResult<()> {
        let shared = &self.shared;
        shared.flushing.fetch_add(1, Ordering::AcqRel);
        let _guard = FlushGuard(&shared.flushing);
        shared.wakeup.notify_one();

        tokio::time::timeout(timeout, shared.wait_idle())
            .await
            .map_err(|_| ProducerError::FlushTimeout(timeout))
    }

    pub fn status(&self) -> ProducerStatus {
        let shared = &self.shared;
        let accumulator = shared.accumulator.status();
        ProducerStatus {
            pending_records: accumulator.pending_records,
            in_flight_batches: accumulator.in_flight_batches,
            unresolved: shared.tracker.pending_count(),
            acknowledged: shared.stats.acknowledged.load(Ordering::Relaxed),
            failed: shared.stats.failed.load(Ordering::Relaxed),
            retries: shared.stats.retries.load(Ordering::Relaxed),
            closed: shared.accumulator.is_closed(),
        }
    }

    /// Stop accepting records, send what is queued, and stop the sender.
    ///
    /// Records still unresolved after `timeout` fail with
    /// [`DeliveryError::Shutdown`] and the call returns
    /// [`ProducerError::FlushTimeout`].
    pub async fn close(mut self, timeout: Duration) -> ProducerResult<()> {
        let shared = self.shared.clone();
        shared.accumulator.close();
        shared.wakeup.notify_one();
        info!(pending = shared.tracker.pending_count(), "Closing producer");

        let drained = tokio::time::timeout(timeout, shared.wait_idle())
            .await
            .is_ok();

        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Sender loop ended abnormally");
            }
        }

        // The sender loop fails leftovers on exit; this covers a loop that
        // panicked.
        shared.accumulator.drain_all();
        shared.tracker.fail_all(DeliveryError::Shutdown);

        if drained {
            info!("Producer closed");
            Ok(())
        } else {
            warn!(timeout = ?timeout, "Producer closed before all records resolved");
            Err(ProducerError::FlushTimeout(timeout))
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Sender loop: turns ready queues into in-flight batches until shut down.
async fn run_sender(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut in_flight = JoinSet::new();
    debug!("Sender loop started");

    loop {
        let force = shared.force_flush();
        for batch in shared.accumulator.ready(Instant::now(), force) {
            debug!(
                batch_id = %batch.batch_id,
                destination = %batch.destination,
                records = batch.len(),
                attempt = batch.attempt,
                "Dispatching batch"
            );
            let shared = shared.clone();
            in_flight.spawn(async move { shared.dispatch(batch).await });
        }

        let deadline = shared
            .accumulator
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_POLL);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = shared.wakeup.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {}
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Batch task failed");
                }
            }
        }
    }

    let aborted = in_flight.len();
    in_flight.shutdown().await;

    let abandoned = shared.accumulator.drain_all().len();
    let failed = shared.tracker.fail_all(DeliveryError::Shutdown);
    if failed > 0 {
        warn!(
            aborted_batches = aborted,
            queued = abandoned,
            failed,
            "Sender loop stopped with unresolved records"
        );
    } else {
        debug!("Sender loop stopped");
    }
}
