//! Routing packet encoding, sealing and batch parsing.
//!
//! The routing packet is the outer envelope every transport carries. Its
//! header travels sealed, so a passive observer sees only a nonce and
//! uniform ciphertext; the payload is opaque here and stays sealed until a
//! layer with the right key opens it.

use rand::RngCore;
use tracing::warn;

use crate::aead;
use crate::types::{
    CourierError, MessageKind, Result, RuntimeKind, SessionId, KEY_SIZE, MIN_PACKET_SIZE,
    NONCE_SIZE, ROUTING_HEADER_SIZE, SESSION_ID_SIZE,
};

/// Plaintext routing header, carried sealed inside every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingHeader {
    /// Session the packet belongs to.
    pub session_id: SessionId,
    /// Runtime family of the sending agent.
    pub runtime: RuntimeKind,
    /// What the payload means to the receiver.
    pub kind: MessageKind,
    /// Reserved flag bits, zero today.
    pub extra_flags: u16,
    /// Length of the payload that follows the sealed header.
    pub payload_len: u32,
}

impl RoutingHeader {
    /// Encode to the 16-byte wire form.
    ///
    /// Format:
    /// - [0-7]   sessionId (8 bytes)
    /// - [8]     runtimeKind
    /// - [9]     messageKind
    /// - [10-11] extraFlags (LE)
    /// - [12-15] payloadLength (LE)
    pub fn encode(&self) -> [u8; ROUTING_HEADER_SIZE] {
        let mut data = [0u8; ROUTING_HEADER_SIZE];
        data[..SESSION_ID_SIZE].copy_from_slice(self.session_id.as_bytes());
        data[8] = self.runtime.as_byte();
        data[9] = self.kind.as_byte();
        data[10..12].copy_from_slice(&self.extra_flags.to_le_bytes());
        data[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        data
    }

    /// Decode the 16-byte wire form.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != ROUTING_HEADER_SIZE {
            return Err(CourierError::MalformedPacket(format!(
                "routing header must be {} bytes, got {}",
                ROUTING_HEADER_SIZE,
                data.len()
            )));
        }

        let session_id = SessionId::from_slice(&data[..SESSION_ID_SIZE])?;
        let runtime = RuntimeKind::try_from(data[8])?;
        let kind = MessageKind::try_from(data[9])?;
        let extra_flags = u16::from_le_bytes([data[10], data[11]]);
        let payload_len = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);

        Ok(Self {
            session_id,
            runtime,
            kind,
            extra_flags,
            payload_len,
        })
    }
}

/// One packet recovered from a transport buffer.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    /// The opened routing header.
    pub header: RoutingHeader,
    /// Payload bytes, still sealed under whatever key the sender used.
    pub payload: Vec<u8>,
    /// The packet's exact bytes as received, preserved for relaying.
    pub raw: Vec<u8>,
}

/// Build one sealed routing packet.
///
/// Wire format:
/// - [0-11]  nonce (12 bytes, fresh random)
/// - [12-43] sealed header (16-byte header ciphertext + 16-byte tag)
/// - [44+]   payload (opaque; already sealed by the caller)
///
/// # Arguments
/// * `key` - Key sealing the header, normally the pre-shared key so any
///   hop on the path can frame the packet
/// * `session_id` - Session the packet belongs to
/// * `runtime` - Sending agent's runtime family
/// * `kind` - Payload meaning
/// * `extra_flags` - Reserved flag bits
/// * `payload` - Opaque payload bytes
pub fn build(
    key: &[u8; KEY_SIZE],
    session_id: SessionId,
    runtime: RuntimeKind,
    kind: MessageKind,
    extra_flags: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    if payload.len() > u32::MAX as usize {
        return Err(CourierError::MessageTooLarge(payload.len()));
    }

    let header = RoutingHeader {
        session_id,
        runtime,
        kind,
        extra_flags,
        payload_len: payload.len() as u32,
    };

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed_header = aead::seal(key, &nonce, &header.encode(), b"");

    let mut packet = Vec::with_capacity(MIN_PACKET_SIZE + payload.len());
    packet.extend_from_slice(&nonce);
    packet.extend_from_slice(&sealed_header);
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Parse a single packet from the front of `buffer`.
///
/// # Returns
/// The parsed packet and the unconsumed remainder of the buffer
pub fn try_parse_one<'a>(
    key: &[u8; KEY_SIZE],
    buffer: &'a [u8],
) -> Result<(ParsedPacket, &'a [u8])> {
    if buffer.len() < MIN_PACKET_SIZE {
        return Err(CourierError::MalformedPacket(format!(
            "packet too short: {} bytes (minimum {})",
            buffer.len(),
            MIN_PACKET_SIZE
        )));
    }

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&buffer[..NONCE_SIZE]);

    let header_plain = aead::open(key, &nonce, &buffer[NONCE_SIZE..MIN_PACKET_SIZE], b"")?;
    let header = RoutingHeader::decode(&header_plain)?;

    let payload_len = header.payload_len as usize;
    let total = MIN_PACKET_SIZE + payload_len;
    if buffer.len() < total {
        return Err(CourierError::MalformedPacket(format!(
            "header claims {} payload bytes but {} remain",
            payload_len,
            buffer.len() - MIN_PACKET_SIZE
        )));
    }

    let packet = ParsedPacket {
        header,
        payload: buffer[MIN_PACKET_SIZE..total].to_vec(),
        raw: buffer[..total].to_vec(),
    };
    Ok((packet, &buffer[total..]))
}

/// Parse every packet in a transport buffer, front to back.
///
/// Parsing stops at the first failure and drops the rest of the buffer: an
/// unopenable header means a foreign or tampered packet, and nothing past
/// it can be framed. Packets parsed before the failure are still returned,
/// so a buffer sealed under a different key yields an empty batch rather
/// than an error.
pub fn parse(key: &[u8; KEY_SIZE], buffer: &[u8]) -> Vec<ParsedPacket> {
    let mut packets = Vec::new();
    let mut remaining = buffer;

    while !remaining.is_empty() {
        match try_parse_one(key, remaining) {
            Ok((packet, rest)) => {
                packets.push(packet);
                remaining = rest;
            }
            Err(err) => {
                warn!(
                    parsed = packets.len(),
                    dropped = remaining.len(),
                    error = %err,
                    "dropping undecodable transport bytes"
                );
                break;
            }
        }
    }

    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: [u8; KEY_SIZE] = [0u8; KEY_SIZE];

    fn staging_packet(payload: &[u8]) -> Vec<u8> {
        build(
            &TEST_KEY,
            SessionId::new(*b"AAAAAAAA"),
            RuntimeKind::Native,
            MessageKind::StagingRequest,
            0,
            payload,
        )
        .unwrap()
    }

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let header = RoutingHeader {
            session_id: SessionId::new(*b"K3V9XQ2M"),
            runtime: RuntimeKind::Script,
            kind: MessageKind::ResultPost,
            extra_flags: 0x0102,
            payload_len: 4096,
        };

        let encoded = header.encode();
        assert_eq!(encoded.len(), ROUTING_HEADER_SIZE);
        assert_eq!(RoutingHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_unknown_kind() {
        let mut encoded = RoutingHeader {
            session_id: SessionId::placeholder(),
            runtime: RuntimeKind::Native,
            kind: MessageKind::None,
            extra_flags: 0,
            payload_len: 0,
        }
        .encode();
        encoded[9] = 0x77;

        let result = RoutingHeader::decode(&encoded);
        assert!(matches!(result, Err(CourierError::UnknownMessageKind(0x77))));
    }

    #[test]
    fn test_staging_packet_round_trip() {
        let packet = staging_packet(b"PUBKEY");
        assert_eq!(packet.len(), MIN_PACKET_SIZE + 6);

        let packets = parse(&TEST_KEY, &packet);
        assert_eq!(packets.len(), 1);

        let parsed = &packets[0];
        assert_eq!(parsed.header.session_id.as_bytes(), b"AAAAAAAA");
        assert_eq!(parsed.header.runtime, RuntimeKind::Native);
        assert_eq!(parsed.header.kind, MessageKind::StagingRequest);
        assert_eq!(parsed.header.extra_flags, 0);
        assert_eq!(parsed.payload, b"PUBKEY");
        assert_eq!(parsed.raw, packet);
    }

    #[test]
    fn test_round_trip_across_payload_sizes() {
        for size in [0usize, 1, 64, 4096] {
            let payload = vec![0xA5u8; size];
            let packet = staging_packet(&payload);
            let packets = parse(&TEST_KEY, &packet);
            assert_eq!(packets.len(), 1, "size {}", size);
            assert_eq!(packets[0].payload, payload, "size {}", size);
            assert_eq!(packets[0].header.payload_len as usize, size);
        }
    }

    #[test]
    fn test_batch_parses_in_order() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&staging_packet(b"first"));
        buffer.extend_from_slice(&staging_packet(b"second"));
        buffer.extend_from_slice(&staging_packet(b"third"));

        let packets = parse(&TEST_KEY, &buffer);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].payload, b"first");
        assert_eq!(packets[1].payload, b"second");
        assert_eq!(packets[2].payload, b"third");
    }

    #[test]
    fn test_foreign_key_yields_empty_batch() {
        let packet = staging_packet(b"PUBKEY");
        let foreign = [0xFFu8; KEY_SIZE];
        assert!(parse(&foreign, &packet).is_empty());
    }

    #[test]
    fn test_wrong_key_surfaces_auth_failure_on_single_parse() {
        let packet = staging_packet(b"PUBKEY");
        let foreign = [0xFFu8; KEY_SIZE];
        let result = try_parse_one(&foreign, &packet);
        assert!(matches!(result, Err(CourierError::AuthenticationFailure)));
    }

    #[test]
    fn test_truncated_payload_is_malformed_without_panic() {
        let packet = staging_packet(b"a payload that will be cut short");
        let truncated = &packet[..packet.len() - 5];
        let result = try_parse_one(&TEST_KEY, truncated);
        assert!(matches!(result, Err(CourierError::MalformedPacket(_))));
    }

    #[test]
    fn test_batch_stops_at_tampered_packet() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&staging_packet(b"good"));
        let mut bad = staging_packet(b"bad");
        bad[NONCE_SIZE + 3] ^= 0xA5;
        buffer.extend_from_slice(&bad);
        buffer.extend_from_slice(&staging_packet(b"unreached"));

        let packets = parse(&TEST_KEY, &buffer);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, b"good");
    }

    #[test]
    fn test_trailing_runt_is_dropped() {
        let mut buffer = staging_packet(b"whole");
        buffer.extend_from_slice(&[0u8; 10]);

        let packets = parse(&TEST_KEY, &buffer);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, b"whole");
    }

    #[test]
    fn test_empty_payload_packet() {
        let packet = build(
            &TEST_KEY,
            SessionId::placeholder(),
            RuntimeKind::None,
            MessageKind::None,
            0,
            b"",
        )
        .unwrap();
        assert_eq!(packet.len(), MIN_PACKET_SIZE);

        let packets = parse(&TEST_KEY, &packet);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].payload.is_empty());
        assert!(packets[0].header.session_id.is_placeholder());
    }

    #[test]
    fn test_nonces_are_fresh_per_build() {
        let a = staging_packet(b"same");
        let b = staging_packet(b"same");
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }
}
