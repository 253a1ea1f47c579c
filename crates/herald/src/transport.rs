//! Broker transport.
//!
//! [`Transport`] is the seam between the sender loop and the network.
//! [`TcpTransport`] keeps one lazily opened connection per broker endpoint.
//! Each connection carries one request at a time, so batches routed to the
//! same endpoint are written and acknowledged in order.
//!
//! A send's timeout covers the whole call: waiting for the connection,
//! connecting, writing and reading the acknowledgment.

use crate::config::{Endpoint, RequiredAcks};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{read_frame, AckFrame, ProduceFrame};
use crate::record::{Batch, BatchAck, Destination};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reachability of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub endpoint: String,
    pub reachable: bool,
    pub error: Option<String>,
}

/// Sends batches to brokers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `batch` and return the broker's answer within `timeout`.
    async fn send(
        &self,
        batch: &Batch,
        acks: RequiredAcks,
        timeout: Duration,
    ) -> TransportResult<BatchAck>;

    /// Check which endpoints accept connections. One report per endpoint.
    async fn probe(&self, timeout: Duration) -> Vec<ProbeReport>;
}

/// Single connection to a broker.
pub struct BrokerClient {
    endpoint: String,
    stream: TcpStream,
    read_buf: Vec<u8>,
}

impl BrokerClient {
    /// Connect to `endpoint`, giving up after `connect_timeout`.
    pub async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> TransportResult<Self> {
        let name = endpoint.to_string();
        let addr = (endpoint.host.as_str(), endpoint.port);

        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Connect {
                endpoint: name.clone(),
                reason: format!("timed out after {:?}", connect_timeout),
            })?
            .map_err(|e| TransportError::Connect {
                endpoint: name.clone(),
                reason: e.to_string(),
            })?;

        // Frames are written whole; no point holding them back.
        let _ = stream.set_nodelay(true);

        debug!(endpoint = %name, "Connected to broker");

        Ok(Self {
            endpoint: name,
            stream,
            read_buf: Vec::with_capacity(4096),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Write `encoded` (the encoding of `frame`) and, unless acks are
    /// disabled, wait for the matching acknowledgment until `deadline`.
    /// `budget` is the timeout reported when the deadline passes.
    pub async fn produce(
        &mut self,
        frame: &ProduceFrame,
        encoded: &[u8],
        deadline: Instant,
        budget: Duration,
    ) -> TransportResult<BatchAck> {
        let batch_id = frame.batch_id;
        let acks = frame.acks;

        let result = timeout_at(deadline, async {
            self.write_frame(encoded).await?;
            debug!(
                endpoint = %self.endpoint,
                batch_id = %batch_id,
                records = frame.records.len(),
                bytes = encoded.len(),
                "Sent produce frame"
            );

            if acks == RequiredAcks::None {
                return Ok(BatchAck { base_offset: None });
            }

            let ack = self.read_ack_frame().await?;
            Self::check_ack(batch_id, ack)
        })
        .await;

        result.map_err(|_| TransportError::Timeout {
            endpoint: self.endpoint.clone(),
            timeout: budget,
        })?
    }

    fn check_ack(batch_id: Uuid, ack: AckFrame) -> TransportResult<BatchAck> {
        if ack.batch_id != batch_id {
            return Err(TransportError::Protocol(format!(
                "Ack batch_id mismatch: expected {}, got {}",
                batch_id, ack.batch_id
            )));
        }

        match ack.error {
            None => Ok(BatchAck {
                base_offset: Some(ack.base_offset),
            }),
            Some(code) => Err(TransportError::Broker {
                code,
                message: ack.message,
            }),
        }
    }

    async fn write_frame(&mut self, encoded: &[u8]) -> TransportResult<()> {
        self.stream
            .write_all(encoded)
            .await
            .map_err(|e| self.reset(format!("write failed: {}", e)))
    }

    async fn read_ack_frame(&mut self) -> TransportResult<AckFrame> {
        loop {
            if let Some((frame_data, consumed)) = read_frame(&self.read_buf)? {
                let frame = AckFrame::decode(frame_data)?;
                self.read_buf.drain(..consumed);
                return Ok(frame);
            }

            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| self.reset(format!("read failed: {}", e)))?;

            if n == 0 {
                return Err(self.reset("broker closed connection".to_string()));
            }

            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn reset(&self, reason: String) -> TransportError {
        TransportError::ConnectionReset {
            endpoint: self.endpoint.clone(),
            reason,
        }
    }
}

struct BrokerConnection {
    endpoint: Endpoint,
    client: Mutex<Option<BrokerClient>>,
}

/// TCP transport with one connection per endpoint.
pub struct TcpTransport {
    connections: Vec<BrokerConnection>,
}

impl TcpTransport {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let connections = endpoints
            .into_iter()
            .map(|endpoint| BrokerConnection {
                endpoint,
                client: Mutex::new(None),
            })
            .collect();
        Self { connections }
    }

    pub fn endpoints(&self) -> Vec<&Endpoint> {
        self.connections.iter().map(|c| &c.endpoint).collect()
    }

    /// Endpoint index that serves `destination`.
    pub fn route(&self, destination: &Destination) -> usize {
        route(destination, self.connections.len())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        batch: &Batch,
        acks: RequiredAcks,
        timeout_duration: Duration,
    ) -> TransportResult<BatchAck> {
        let connection = self
            .connections
            .get(self.route(&batch.destination))
            .ok_or_else(|| TransportError::Protocol("No broker endpoints".to_string()))?;

        let deadline = Instant::now() + timeout_duration;
        let expired = || TransportError::Timeout {
            endpoint: connection.endpoint.to_string(),
            timeout: timeout_duration,
        };

        // Encode before touching the connection.
        let frame = ProduceFrame::from_batch(batch, acks);
        let encoded = frame.encode()?;

        let mut slot = timeout_at(deadline, connection.client.lock())
            .await
            .map_err(|_| expired())?;
        if slot.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(expired());
            }
            let client = BrokerClient::connect(&connection.endpoint, remaining).await?;
            info!(endpoint = %connection.endpoint, "Broker connection established");
            *slot = Some(client);
        }

        let client = match slot.as_mut() {
            Some(client) => client,
            None => {
                return Err(TransportError::Connect {
                    endpoint: connection.endpoint.to_string(),
                    reason: "connection unavailable".to_string(),
                })
            }
        };

        let result = client
            .produce(&frame, &encoded, deadline, timeout_duration)
            .await;

        if let Err(e) = &result {
            if e.poisons_connection() {
                warn!(
                    endpoint = %connection.endpoint,
                    error = %e,
                    "Dropping broker connection"
                );
                *slot = None;
            }
        }

        result
    }

    async fn probe(&self, timeout_duration: Duration) -> Vec<ProbeReport> {
        let mut reports = Vec::with_capacity(self.connections.len());
        for connection in &self.connections {
            let endpoint = connection.endpoint.to_string();
            let report = match BrokerClient::connect(&connection.endpoint, timeout_duration).await
            {
                Ok(_) => ProbeReport {
                    endpoint,
                    reachable: true,
                    error: None,
                },
                Err(e) => ProbeReport {
                    endpoint,
                    reachable: false,
                    error: Some(e.to_string()),
                },
            };
            reports.push(report);
        }
        reports
    }
}

/// Stable endpoint choice for a destination (FNV-1a).
fn route(destination: &Destination, endpoints: usize) -> usize {
    if endpoints <= 1 {
        return 0;
    }

    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let partition = destination.partition.unwrap_or(u32::MAX);
    for byte in destination
        .topic
        .as_bytes()
        .iter()
        .chain(partition.to_le_bytes().iter())
    {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % endpoints as u64) as usize
}
