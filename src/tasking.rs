//! Task record encoding, fragmentation and reassembly.
//!
//! Task records ride inside already-sealed session payloads, so this layer
//! does plain framing: fixed little-endian header, base64 text in the data
//! field, records concatenated back to back with no delimiter.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::warn;

use crate::types::{CourierError, Result, TASK_HEADER_SIZE};

/// One task record as framed inside a session payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPacket {
    /// Application-defined task type.
    pub kind: u16,
    /// Total fragments in the message this record belongs to.
    pub total_fragments: u16,
    /// This record's 1-based position within its message.
    pub fragment_index: u16,
    /// Groups the fragments of one message.
    pub correlation_id: u16,
    /// Record data: base64 text of one raw fragment.
    pub data: Vec<u8>,
}

impl TaskPacket {
    /// Encode to wire form.
    ///
    /// Format:
    /// - [0-1]   taskKind (LE)
    /// - [2-3]   totalFragments (LE)
    /// - [4-5]   fragmentIndex (LE)
    /// - [6-7]   correlationId (LE)
    /// - [8-11]  dataLength (LE)
    /// - [12+]   data
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TASK_HEADER_SIZE + self.data.len());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(&self.total_fragments.to_le_bytes());
        out.extend_from_slice(&self.fragment_index.to_le_bytes());
        out.extend_from_slice(&self.correlation_id.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode one record from the front of `buffer`.
    ///
    /// # Returns
    /// The record and the unconsumed remainder of the buffer
    pub fn decode(buffer: &[u8]) -> Result<(Self, &[u8])> {
        if buffer.len() < TASK_HEADER_SIZE {
            return Err(CourierError::MalformedPacket(format!(
                "task record too short: {} bytes (minimum {})",
                buffer.len(),
                TASK_HEADER_SIZE
            )));
        }

        let kind = u16::from_le_bytes([buffer[0], buffer[1]]);
        let total_fragments = u16::from_le_bytes([buffer[2], buffer[3]]);
        let fragment_index = u16::from_le_bytes([buffer[4], buffer[5]]);
        let correlation_id = u16::from_le_bytes([buffer[6], buffer[7]]);
        let length = u32::from_le_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]) as usize;

        let total = TASK_HEADER_SIZE.checked_add(length).ok_or_else(|| {
            CourierError::MalformedPacket(format!("task record length overflows: {}", length))
        })?;
        if buffer.len() < total {
            return Err(CourierError::MalformedPacket(format!(
                "task record claims {} data bytes but {} remain",
                length,
                buffer.len() - TASK_HEADER_SIZE
            )));
        }

        let record = Self {
            kind,
            total_fragments,
            fragment_index,
            correlation_id,
            data: buffer[TASK_HEADER_SIZE..total].to_vec(),
        };
        Ok((record, &buffer[total..]))
    }
}

/// Trailing bytes that would not frame after at least one good record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentAnomaly {
    /// Records successfully decoded before the anomaly.
    pub decoded: usize,
    /// Undecodable bytes left at the tail.
    pub trailing: usize,
}

/// Frame `data` as a single task record.
pub fn encode(kind: u16, correlation_id: u16, data: &[u8]) -> Result<Vec<u8>> {
    let text = STANDARD.encode(data);
    if text.len() > u32::MAX as usize {
        return Err(CourierError::MessageTooLarge(data.len()));
    }
    Ok(TaskPacket {
        kind,
        total_fragments: 1,
        fragment_index: 1,
        correlation_id,
        data: text.into_bytes(),
    }
    .encode())
}

/// Split `data` into fragments of at most `max_fragment_len` raw bytes and
/// frame them as consecutive records sharing `correlation_id`.
///
/// Fragment indices are 1-based and emitted in order.
pub fn encode_fragmented(
    kind: u16,
    correlation_id: u16,
    data: &[u8],
    max_fragment_len: usize,
) -> Result<Vec<u8>> {
    if data.is_empty() {
        return encode(kind, correlation_id, data);
    }

    let max_fragment_len = max_fragment_len.max(1);
    let total = data.len().div_ceil(max_fragment_len);
    if total > u16::MAX as usize {
        return Err(CourierError::MessageTooLarge(data.len()));
    }

    let mut out = Vec::new();
    for (index, chunk) in data.chunks(max_fragment_len).enumerate() {
        let text = STANDARD.encode(chunk);
        if text.len() > u32::MAX as usize {
            return Err(CourierError::MessageTooLarge(data.len()));
        }
        let record = TaskPacket {
            kind,
            total_fragments: total as u16,
            fragment_index: (index + 1) as u16,
            correlation_id,
            data: text.into_bytes(),
        };
        out.extend_from_slice(&record.encode());
    }
    Ok(out)
}

/// Decode every record in a session payload.
///
/// A short or inconsistent tail after at least one good record is reported
/// as a [`FragmentAnomaly`] next to the records already decoded, so the
/// caller keeps the good prefix. A buffer whose first record will not
/// frame is malformed outright. An empty buffer is a valid empty stream.
pub fn decode_stream(buffer: &[u8]) -> Result<(Vec<TaskPacket>, Option<FragmentAnomaly>)> {
    let mut records = Vec::new();
    let mut remaining = buffer;

    while !remaining.is_empty() {
        match TaskPacket::decode(remaining) {
            Ok((record, rest)) => {
                records.push(record);
                remaining = rest;
            }
            Err(err) => {
                if records.is_empty() {
                    return Err(err);
                }
                let anomaly = FragmentAnomaly {
                    decoded: records.len(),
                    trailing: remaining.len(),
                };
                warn!(
                    decoded = anomaly.decoded,
                    trailing = anomaly.trailing,
                    error = %err,
                    "task stream ended mid-record; delivering decoded prefix"
                );
                return Ok((records, Some(anomaly)));
            }
        }
    }

    Ok((records, None))
}

/// Reassemble one message from records sharing a correlation ID.
///
/// Fragments are concatenated strictly in the order given, which is
/// arrival order on the request/response transports this protocol rides;
/// fragment indices are carried but not used to reorder.
pub fn reassemble(records: &[TaskPacket]) -> Result<Vec<u8>> {
    let mut message = Vec::new();
    for record in records {
        let raw = STANDARD.decode(&record.data).map_err(|e| {
            CourierError::MalformedPacket(format!("fragment data is not valid base64: {}", e))
        })?;
        message.extend_from_slice(&raw);
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encode_decode_roundtrip() {
        let record = TaskPacket {
            kind: 40,
            total_fragments: 3,
            fragment_index: 2,
            correlation_id: 777,
            data: b"SGVsbG8=".to_vec(),
        };

        let encoded = record.encode();
        assert_eq!(encoded.len(), TASK_HEADER_SIZE + 8);

        let (decoded, rest) = TaskPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_single_record_message() {
        let buffer = encode(40, 9, b"whoami").unwrap();
        let (records, anomaly) = decode_stream(&buffer).unwrap();

        assert!(anomaly.is_none());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_fragments, 1);
        assert_eq!(records[0].fragment_index, 1);
        assert_eq!(records[0].correlation_id, 9);
        assert_eq!(reassemble(&records).unwrap(), b"whoami");
    }

    #[test]
    fn test_fragmented_message_reassembles() {
        let data = b"0123456789";
        let buffer = encode_fragmented(41, 5, data, 4).unwrap();
        let (records, anomaly) = decode_stream(&buffer).unwrap();

        assert!(anomaly.is_none());
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.total_fragments, 3);
            assert_eq!(record.fragment_index, (i + 1) as u16);
            assert_eq!(record.correlation_id, 5);
        }
        assert_eq!(reassemble(&records).unwrap(), data);
    }

    #[test]
    fn test_fragment_counts_one_two_five() {
        let data = b"twenty bytes of data";
        for (max_len, expected) in [(20usize, 1u16), (10, 2), (4, 5)] {
            let buffer = encode_fragmented(41, 7, data, max_len).unwrap();
            let (records, anomaly) = decode_stream(&buffer).unwrap();
            assert!(anomaly.is_none());
            assert_eq!(records.len(), expected as usize);
            assert_eq!(records[0].total_fragments, expected);
            assert_eq!(reassemble(&records).unwrap(), data);
        }
    }

    #[test]
    fn test_mixed_correlations_decode_in_order() {
        let mut buffer = encode(40, 1, b"first").unwrap();
        buffer.extend_from_slice(&encode(41, 2, b"second").unwrap());

        let (records, anomaly) = decode_stream(&buffer).unwrap();
        assert!(anomaly.is_none());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].correlation_id, 1);
        assert_eq!(records[1].correlation_id, 2);
    }

    #[test]
    fn test_trailing_junk_reports_anomaly_with_partial_records() {
        let mut buffer = encode(40, 1, b"kept").unwrap();
        buffer.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let (records, anomaly) = decode_stream(&buffer).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(reassemble(&records).unwrap(), b"kept");
        assert_eq!(
            anomaly,
            Some(FragmentAnomaly {
                decoded: 1,
                trailing: 4
            })
        );
    }

    #[test]
    fn test_junk_only_buffer_is_malformed() {
        let result = decode_stream(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(matches!(result, Err(CourierError::MalformedPacket(_))));
    }

    #[test]
    fn test_record_claiming_more_data_than_present() {
        let mut buffer = TaskPacket {
            kind: 1,
            total_fragments: 1,
            fragment_index: 1,
            correlation_id: 1,
            data: b"abcd".to_vec(),
        }
        .encode();
        // Inflate the length field past the actual data
        buffer[8..12].copy_from_slice(&100u32.to_le_bytes());

        let result = decode_stream(&buffer);
        assert!(matches!(result, Err(CourierError::MalformedPacket(_))));
    }

    #[test]
    fn test_empty_buffer_is_empty_stream() {
        let (records, anomaly) = decode_stream(b"").unwrap();
        assert!(records.is_empty());
        assert!(anomaly.is_none());
    }

    #[test]
    fn test_empty_data_round_trip() {
        let buffer = encode(7, 3, b"").unwrap();
        let (records, _) = decode_stream(&buffer).unwrap();
        assert_eq!(records.len(), 1);
        assert!(reassemble(&records).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_base64_fails_reassembly() {
        let records = vec![TaskPacket {
            kind: 1,
            total_fragments: 1,
            fragment_index: 1,
            correlation_id: 1,
            data: b"not\xFFbase64".to_vec(),
        }];
        let result = reassemble(&records);
        assert!(matches!(result, Err(CourierError::MalformedPacket(_))));
    }

    #[test]
    fn test_fragment_count_cap() {
        // 70000 one-byte fragments would overflow the u16 total
        let data = vec![0u8; 70_000];
        let result = encode_fragmented(1, 1, &data, 1);
        assert!(matches!(result, Err(CourierError::MessageTooLarge(_))));
    }
}
