//! Binary framing protocol between Herald and a broker.
//!
//! All integers are little-endian. Every frame is preceded by a 4-byte
//! length that excludes itself.
//!
//! ```text
//! ProduceFrame (0x01):
//! [1: type][1: acks][2: reserved][16: batch_id]
//! [2: topic_len][N: topic][4: partition, 0xFFFFFFFF = unassigned]
//! [4: record_count] { [8: timestamp_ms][4: payload_len][N: payload] }*
//!
//! AckFrame (0x02):
//! [1: type][1: status][2: error_code][16: batch_id]
//! [8: base_offset][4: message_len][N: message]
//! ```

use crate::config::RequiredAcks;
use crate::error::{TransportError, TransportResult};
use crate::record::{Batch, Destination};
use std::fmt;
use uuid::Uuid;

/// Frame type identifier for ProduceFrame.
pub const FRAME_TYPE_PRODUCE: u8 = 0x01;

/// Frame type identifier for AckFrame.
pub const FRAME_TYPE_ACK: u8 = 0x02;

/// Ack status: batch appended.
pub const ACK_STATUS_OK: u8 = 0x00;

/// Ack status: batch rejected, see error code.
pub const ACK_STATUS_ERROR: u8 = 0x01;

/// Partition value meaning "broker assigns".
pub const PARTITION_UNASSIGNED: u32 = u32::MAX;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes a record adds to a ProduceFrame on top of its payload.
pub const RECORD_OVERHEAD: usize = 8 + 4;

/// ProduceFrame body without records, for the longest topic name.
pub const MAX_PRODUCE_HEADER_LEN: usize =
    ProduceFrame::FIXED_HEADER + u16::MAX as usize + 4 + 4;

/// Largest record section, overhead included, that always fits a frame.
pub const MAX_RECORDS_LEN: usize = MAX_FRAME_LEN - MAX_PRODUCE_HEADER_LEN;

/// Error codes carried by a rejecting AckFrame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerErrorCode {
    /// Endpoint is not currently accepting writes for the destination.
    NotLeader,
    /// Topic does not exist.
    UnknownTopic,
    /// Client credentials rejected.
    AuthenticationFailed,
    /// Batch or record exceeds broker limits.
    RecordTooLarge,
    /// Broker asks the client to slow down.
    Throttled,
    /// Code this client does not know.
    Unknown(u16),
}

impl BrokerErrorCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => BrokerErrorCode::NotLeader,
            2 => BrokerErrorCode::UnknownTopic,
            3 => BrokerErrorCode::AuthenticationFailed,
            4 => BrokerErrorCode::RecordTooLarge,
            5 => BrokerErrorCode::Throttled,
            other => BrokerErrorCode::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            BrokerErrorCode::NotLeader => 1,
            BrokerErrorCode::UnknownTopic => 2,
            BrokerErrorCode::AuthenticationFailed => 3,
            BrokerErrorCode::RecordTooLarge => 4,
            BrokerErrorCode::Throttled => 5,
            BrokerErrorCode::Unknown(code) => code,
        }
    }

    /// Unknown codes are treated as fatal.
    pub fn is_retryable(self) -> bool {
        matches!(self, BrokerErrorCode::NotLeader | BrokerErrorCode::Throttled)
    }
}

impl fmt::Display for BrokerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerErrorCode::NotLeader => write!(f, "NOT_LEADER"),
            BrokerErrorCode::UnknownTopic => write!(f, "UNKNOWN_TOPIC"),
            BrokerErrorCode::AuthenticationFailed => write!(f, "AUTHENTICATION_FAILED"),
            BrokerErrorCode::RecordTooLarge => write!(f, "RECORD_TOO_LARGE"),
            BrokerErrorCode::Throttled => write!(f, "THROTTLED"),
            BrokerErrorCode::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// One record as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub timestamp_ms: i64,
    pub payload: Vec<u8>,
}

/// Batch of records sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceFrame {
    pub batch_id: Uuid,
    pub acks: RequiredAcks,
    pub destination: Destination,
    pub records: Vec<WireRecord>,
}

impl ProduceFrame {
    /// type + acks + reserved + batch_id + topic_len
    const FIXED_HEADER: usize = 1 + 1 + 2 + 16 + 2;

    pub fn from_batch(batch: &Batch, acks: RequiredAcks) -> Self {
        Self {
            batch_id: batch.batch_id,
            acks,
            destination: batch.destination.clone(),
            records: batch
                .entries
                .iter()
                .map(|e| WireRecord {
                    timestamp_ms: e.record.created_at().timestamp_millis(),
                    payload: e.record.payload().to_vec(),
                })
                .collect(),
        }
    }

    /// Encode the frame, including the length prefix.
    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        let topic = self.destination.topic.as_bytes();
        let topic_len = u16::try_from(topic.len()).map_err(|_| {
            TransportError::Encode(format!("Topic name too long: {} bytes", topic.len()))
        })?;

        let body_len = Self::FIXED_HEADER
            + topic.len()
            + 4
            + 4
            + self
                .records
                .iter()
                .map(|r| RECORD_OVERHEAD + r.payload.len())
                .sum::<usize>();

        if body_len > MAX_FRAME_LEN {
            return Err(TransportError::Encode(format!(
                "ProduceFrame of {} bytes exceeds limit of {}",
                body_len, MAX_FRAME_LEN
            )));
        }

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.push(FRAME_TYPE_PRODUCE);
        buf.push(self.acks.to_byte());
        buf.extend_from_slice(&[0u8, 0u8]);
        buf.extend_from_slice(self.batch_id.as_bytes());
        buf.extend_from_slice(&topic_len.to_le_bytes());
        buf.extend_from_slice(topic);
        buf.extend_from_slice(
            &self
                .destination
                .partition
                .unwrap_or(PARTITION_UNASSIGNED)
                .to_le_bytes(),
        );
        buf.extend_from_slice(&(self.records.len() as u32).to_le_bytes());

        for record in &self.records {
            buf.extend_from_slice(&record.timestamp_ms.to_le_bytes());
            buf.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(&record.payload);
        }

        Ok(buf)
    }

    /// Decode a frame body (length prefix already stripped).
    pub fn decode(data: &[u8]) -> TransportResult<Self> {
        let mut reader = FrameReader::new(data, "ProduceFrame");

        reader.expect_type(FRAME_TYPE_PRODUCE)?;
        let acks = RequiredAcks::from_byte(reader.u8()?)
            .ok_or_else(|| TransportError::Protocol("Unknown acks byte".to_string()))?;
        reader.skip(2)?;
        let batch_id = reader.uuid()?;

        let topic_len = reader.u16()? as usize;
        let topic = String::from_utf8(reader.bytes(topic_len)?.to_vec())
            .map_err(|_| TransportError::Protocol("Topic is not valid UTF-8".to_string()))?;
        let partition = match reader.u32()? {
            PARTITION_UNASSIGNED => None,
            p => Some(p),
        };

        let count = reader.u32()? as usize;
        let mut records = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let timestamp_ms = reader.i64()?;
            let len = reader.u32()? as usize;
            let payload = reader.bytes(len)?.to_vec();
            records.push(WireRecord {
                timestamp_ms,
                payload,
            });
        }
        reader.finish()?;

        Ok(Self {
            batch_id,
            acks,
            destination: Destination { topic, partition },
            records,
        })
    }
}

/// Broker's answer to a ProduceFrame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub batch_id: Uuid,
    /// `None` when the batch was appended.
    pub error: Option<BrokerErrorCode>,
    pub base_offset: u64,
    pub message: String,
}

impl AckFrame {
    /// type + status + error_code + batch_id + base_offset + message_len
    const HEADER_SIZE: usize = 1 + 1 + 2 + 16 + 8 + 4;

    pub fn ok(batch_id: Uuid, base_offset: u64) -> Self {
        Self {
            batch_id,
            error: None,
            base_offset,
            message: String::new(),
        }
    }

    pub fn error(batch_id: Uuid, code: BrokerErrorCode, message: impl Into<String>) -> Self {
        Self {
            batch_id,
            error: Some(code),
            base_offset: 0,
            message: message.into(),
        }
    }

    /// Encode the frame, including the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let message = self.message.as_bytes();
        let body_len = Self::HEADER_SIZE + message.len();

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.push(FRAME_TYPE_ACK);
        match self.error {
            None => {
                buf.push(ACK_STATUS_OK);
                buf.extend_from_slice(&0u16.to_le_bytes());
            }
            Some(code) => {
                buf.push(ACK_STATUS_ERROR);
                buf.extend_from_slice(&code.to_u16().to_le_bytes());
            }
        }
        buf.extend_from_slice(self.batch_id.as_bytes());
        buf.extend_from_slice(&self.base_offset.to_le_bytes());
        buf.extend_from_slice(&(message.len() as u32).to_le_bytes());
        buf.extend_from_slice(message);
        buf
    }

    /// Decode a frame body (length prefix already stripped).
    pub fn decode(data: &[u8]) -> TransportResult<Self> {
        let mut reader = FrameReader::new(data, "AckFrame");

        reader.expect_type(FRAME_TYPE_ACK)?;
        let status = reader.u8()?;
        let code = reader.u16()?;
        let error = match status {
            ACK_STATUS_OK => None,
            ACK_STATUS_ERROR => Some(BrokerErrorCode::from_u16(code)),
            other => {
                return Err(TransportError::Protocol(format!(
                    "Unknown ack status {:#04x}",
                    other
                )))
            }
        };
        let batch_id = reader.uuid()?;
        let base_offset = reader.u64()?;
        let message_len = reader.u32()? as usize;
        let message = String::from_utf8_lossy(reader.bytes(message_len)?).into_owned();
        reader.finish()?;

        Ok(Self {
            batch_id,
            error,
            base_offset,
            message,
        })
    }
}

/// Split one length-prefixed frame off the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered, otherwise the frame
/// body and the number of bytes consumed. Declared lengths above
/// [`MAX_FRAME_LEN`] are rejected.
pub fn read_frame(buf: &[u8]) -> TransportResult<Option<(&[u8], usize)>> {
    let Some(prefix) = buf.get(0..4) else {
        return Ok(None);
    };

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(prefix);
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!(
            "Frame length {} exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }

    if buf.len() < 4 + len {
        return Ok(None);
    }

    Ok(Some((&buf[4..4 + len], 4 + len)))
}

/// Bounds-checked little-endian reader over a frame body.
struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
    frame: &'static str,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8], frame: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            frame,
        }
    }

    fn bytes(&mut self, len: usize) -> TransportResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len());
        let Some(end) = end else {
            return Err(TransportError::Protocol(format!(
                "{} truncated: need {} bytes at offset {}, have {}",
                self.frame,
                len,
                self.pos,
                self.data.len()
            )));
        };
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> TransportResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn skip(&mut self, len: usize) -> TransportResult<()> {
        self.bytes(len).map(|_| ())
    }

    fn u8(&mut self) -> TransportResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> TransportResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> TransportResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> TransportResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    fn i64(&mut self) -> TransportResult<i64> {
        self.array().map(i64::from_le_bytes)
    }

    fn uuid(&mut self) -> TransportResult<Uuid> {
        self.array().map(Uuid::from_bytes)
    }

    fn expect_type(&mut self, expected: u8) -> TransportResult<()> {
        let actual = self.u8()?;
        if actual != expected {
            return Err(TransportError::Protocol(format!(
                "Expected {} type {:#04x}, got {:#04x}",
                self.frame, expected, actual
            )));
        }
        Ok(())
    }

    fn finish(&self) -> TransportResult<()> {
        if self.pos != self.data.len() {
            return Err(TransportError::Protocol(format!(
                "{} has {} trailing bytes",
                self.frame,
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BatchEntry, Record, RecordId};
    use chrono::{TimeZone, Utc};

    fn sample_batch(partition: Option<u32>) -> Batch {
        let destination = Destination {
            topic: "ledgerfun".to_string(),
            partition,
        };
        let created = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        Batch::new(
            destination.clone(),
            vec![
                BatchEntry {
                    id: RecordId(1),
                    record: Record::at(destination.clone(), b"ping!".to_vec(), created),
                    prior_attempts: 0,
                },
                BatchEntry {
                    id: RecordId(2),
                    record: Record::at(destination, Vec::new(), created),
                    prior_attempts: 0,
                },
            ],
        )
    }

    #[test]
    fn test_produce_frame_carries_batch() {
        let batch = sample_batch(Some(4));
        let encoded = ProduceFrame::from_batch(&batch, RequiredAcks::Leader)
            .encode()
            .unwrap();

        let (body, consumed) = read_frame(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());

        let frame = ProduceFrame::decode(body).unwrap();
        assert_eq!(frame.batch_id, batch.batch_id);
        assert_eq!(frame.acks, RequiredAcks::Leader);
        assert_eq!(frame.destination, Destination::with_partition("ledgerfun", 4));
        assert_eq!(frame.records.len(), 2);
        assert_eq!(frame.records[0].payload, b"ping!");
        assert_eq!(frame.records[0].timestamp_ms, 1_700_000_000_123);
        assert!(frame.records[1].payload.is_empty());
    }

    #[test]
    fn test_unassigned_partition_survives_encoding() {
        let encoded = ProduceFrame::from_batch(&sample_batch(None), RequiredAcks::None)
            .encode()
            .unwrap();
        let (body, _) = read_frame(&encoded).unwrap().unwrap();
        let frame = ProduceFrame::decode(body).unwrap();
        assert_eq!(frame.destination.partition, None);
        assert_eq!(frame.acks, RequiredAcks::None);
    }

    #[test]
    fn test_ack_frame_error_code() {
        let batch_id = Uuid::new_v4();
        let encoded =
            AckFrame::error(batch_id, BrokerErrorCode::UnknownTopic, "no such topic").encode();
        let (body, _) = read_frame(&encoded).unwrap().unwrap();
        let frame = AckFrame::decode(body).unwrap();

        assert_eq!(frame.batch_id, batch_id);
        assert_eq!(frame.error, Some(BrokerErrorCode::UnknownTopic));
        assert_eq!(frame.message, "no such topic");
    }

    #[test]
    fn test_ack_frame_ok_offset() {
        let batch_id = Uuid::new_v4();
        let encoded = AckFrame::ok(batch_id, 41).encode();
        let (body, _) = read_frame(&encoded).unwrap().unwrap();
        let frame = AckFrame::decode(body).unwrap();
        assert_eq!(frame.error, None);
        assert_eq!(frame.base_offset, 41);
    }

    #[test]
    fn test_records_budget_fits_longest_topic() {
        let mut frame = ProduceFrame {
            batch_id: Uuid::new_v4(),
            acks: RequiredAcks::Leader,
            destination: Destination::new("t".repeat(u16::MAX as usize)),
            records: vec![WireRecord {
                timestamp_ms: 0,
                payload: vec![0; MAX_RECORDS_LEN - RECORD_OVERHEAD],
            }],
        };
        assert_eq!(frame.encode().unwrap().len(), 4 + MAX_FRAME_LEN);

        frame.records[0].payload.push(0);
        assert!(matches!(frame.encode(), Err(TransportError::Encode(_))));
    }

    #[test]
    fn test_topic_longer_than_u16_is_encode_error() {
        let frame = ProduceFrame {
            batch_id: Uuid::new_v4(),
            acks: RequiredAcks::Leader,
            destination: Destination::new("t".repeat(u16::MAX as usize + 1)),
            records: Vec::new(),
        };
        assert!(matches!(frame.encode(), Err(TransportError::Encode(_))));
    }

    #[test]
    fn test_read_frame_incomplete() {
        assert!(read_frame(&[1, 2, 3]).unwrap().is_none());

        let mut buf = vec![100, 0, 0, 0];
        buf.extend_from_slice(&[0; 10]);
        assert!(read_frame(&buf).unwrap().is_none());
    }

    #[test]
    fn test_read_frame_rejects_oversized_length() {
        let buf = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        assert!(matches!(read_frame(&buf), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_read_frame_splits_back_to_back_frames() {
        let first = AckFrame::ok(Uuid::new_v4(), 1).encode();
        let second = AckFrame::ok(Uuid::new_v4(), 2).encode();
        let mut buf = first.clone();
        buf.extend_from_slice(&second);

        let (_, consumed) = read_frame(&buf).unwrap().unwrap();
        assert_eq!(consumed, first.len());
        let (body, _) = read_frame(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(AckFrame::decode(body).unwrap().base_offset, 2);
    }

    #[test]
    fn test_wrong_frame_type() {
        let encoded = AckFrame::ok(Uuid::new_v4(), 0).encode();
        let (body, _) = read_frame(&encoded).unwrap().unwrap();
        assert!(ProduceFrame::decode(body).is_err());
    }

    #[test]
    fn test_truncated_produce_frame() {
        let encoded = ProduceFrame::from_batch(&sample_batch(None), RequiredAcks::Leader)
            .encode()
            .unwrap();
        let body = &encoded[4..encoded.len() - 3];
        assert!(matches!(
            ProduceFrame::decode(body),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = AckFrame::ok(Uuid::new_v4(), 0).encode();
        encoded.push(0xAA);
        assert!(AckFrame::decode(&encoded[4..]).is_err());
    }

    #[test]
    fn test_error_code_mapping() {
        for code in 0u16..8 {
            assert_eq!(BrokerErrorCode::from_u16(code).to_u16(), code);
        }
        assert!(BrokerErrorCode::NotLeader.is_retryable());
        assert!(!BrokerErrorCode::Unknown(42).is_retryable());
        assert_eq!(BrokerErrorCode::Unknown(42).to_string(), "UNKNOWN(42)");
    }
}
