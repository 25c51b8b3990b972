//! Session demultiplexing and relay of foreign traffic.
//!
//! A transport response may batch packets for several sessions sharing the
//! channel. The router splits a parsed batch: packets addressed to the
//! local session go to the tasking layer, everything else is queued for
//! forwarding toward another hop. Foreign payloads are never opened; the
//! original wire bytes travel on with nonce and tag untouched.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::routing::ParsedPacket;
use crate::types::SessionId;

/// A still-sealed packet queued for forwarding toward another hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    /// Session the packet belongs to, per its routing header.
    pub session_id: SessionId,
    /// The packet's exact wire bytes as received.
    pub bytes: Vec<u8>,
}

/// What became of one routed batch.
#[derive(Debug, Default)]
pub struct RouteOutcome {
    /// Packets addressed to the local session, in arrival order.
    pub local: Vec<ParsedPacket>,
    /// Foreign packets handed to the relay channel.
    pub relayed: usize,
    /// Foreign packets lost because the relay channel was full or closed.
    pub dropped: usize,
}

/// Demultiplexer for one local session on a shared transport.
///
/// The relay channel is injected at construction; whoever owns the
/// receiving end decides where forwarded traffic goes next. Routing
/// itself never blocks: a congested relay drops the packet and the
/// sender's retry policy covers the loss.
pub struct SessionRouter {
    local: SessionId,
    relay: mpsc::Sender<RelayFrame>,
}

impl SessionRouter {
    /// Creates a router for `local`, forwarding foreign traffic into
    /// `relay`.
    pub fn new(local: SessionId, relay: mpsc::Sender<RelayFrame>) -> Self {
        Self { local, relay }
    }

    /// Session this router delivers locally.
    pub fn local_session(&self) -> SessionId {
        self.local
    }

    /// Split a parsed batch into local deliveries and relayed frames.
    ///
    /// # Arguments
    /// * `batch` - Packets recovered from one transport buffer, in order
    ///
    /// # Returns
    /// The local packets plus relay and drop counts for the rest
    pub fn route(&self, batch: Vec<ParsedPacket>) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        for packet in batch {
            if packet.header.session_id == self.local {
                outcome.local.push(packet);
                continue;
            }

            let frame = RelayFrame {
                session_id: packet.header.session_id,
                bytes: packet.raw,
            };
            match self.relay.try_send(frame) {
                Ok(()) => outcome.relayed += 1,
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    warn!(
                        session = %frame.session_id,
                        bytes = frame.bytes.len(),
                        "relay queue full, dropping foreign packet"
                    );
                    outcome.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(frame)) => {
                    warn!(
                        session = %frame.session_id,
                        bytes = frame.bytes.len(),
                        "relay channel closed, dropping foreign packet"
                    );
                    outcome.dropped += 1;
                }
            }
        }

        debug!(
            local = outcome.local.len(),
            relayed = outcome.relayed,
            dropped = outcome.dropped,
            "batch routed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing;
    use crate::types::{MessageKind, RuntimeKind, KEY_SIZE};

    const TEST_KEY: [u8; KEY_SIZE] = [0u8; KEY_SIZE];

    fn packet_for(session_id: &[u8; 8], payload: &[u8]) -> Vec<u8> {
        routing::build(
            &TEST_KEY,
            SessionId::new(*session_id),
            RuntimeKind::Native,
            MessageKind::TaskingRequest,
            0,
            payload,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_local_and_foreign_split() {
        let (tx, mut rx) = mpsc::channel(8);
        let router = SessionRouter::new(SessionId::new(*b"LOCAL001"), tx);

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&packet_for(b"LOCAL001", b"mine"));
        let foreign_wire = packet_for(b"OTHER002", b"not mine");
        buffer.extend_from_slice(&foreign_wire);
        buffer.extend_from_slice(&packet_for(b"LOCAL001", b"also mine"));

        let batch = routing::parse(&TEST_KEY, &buffer);
        assert_eq!(batch.len(), 3);

        let outcome = router.route(batch);
        assert_eq!(outcome.local.len(), 2);
        assert_eq!(outcome.local[0].payload, b"mine");
        assert_eq!(outcome.local[1].payload, b"also mine");
        assert_eq!(outcome.relayed, 1);
        assert_eq!(outcome.dropped, 0);

        // The relayed frame is the original wire bytes, untouched
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.session_id.as_bytes(), b"OTHER002");
        assert_eq!(frame.bytes, foreign_wire);
    }

    #[tokio::test]
    async fn test_foreign_payload_stays_sealed() {
        let (tx, mut rx) = mpsc::channel(4);
        let router = SessionRouter::new(SessionId::new(*b"LOCAL001"), tx);

        // The payload is sealed under a key this hop does not hold; only
        // the header parses here
        let opaque = [0xC3u8; 48];
        let wire = packet_for(b"FARAWAY9", &opaque);
        let batch = routing::parse(&TEST_KEY, &wire);

        let outcome = router.route(batch);
        assert_eq!(outcome.relayed, 1);
        assert!(outcome.local.is_empty());

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.bytes, wire);
    }

    #[test]
    fn test_full_relay_queue_drops_and_counts() {
        let (tx, mut rx) = mpsc::channel(1);
        let router = SessionRouter::new(SessionId::new(*b"LOCAL001"), tx);

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&packet_for(b"OTHER001", b"first"));
        buffer.extend_from_slice(&packet_for(b"OTHER002", b"second"));
        buffer.extend_from_slice(&packet_for(b"OTHER003", b"third"));

        let batch = routing::parse(&TEST_KEY, &buffer);
        let outcome = router.route(batch);

        assert_eq!(outcome.relayed, 1);
        assert_eq!(outcome.dropped, 2);
        assert_eq!(
            rx.try_recv().unwrap().session_id.as_bytes(),
            b"OTHER001"
        );
    }

    #[test]
    fn test_closed_relay_channel_drops_without_panic() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let router = SessionRouter::new(SessionId::new(*b"LOCAL001"), tx);

        let wire = packet_for(b"OTHER001", b"lost");
        let batch = routing::parse(&TEST_KEY, &wire);
        let outcome = router.route(batch);

        assert_eq!(outcome.relayed, 0);
        assert_eq!(outcome.dropped, 1);
    }

    #[test]
    fn test_empty_batch_routes_to_nothing() {
        let (tx, _rx) = mpsc::channel(1);
        let router = SessionRouter::new(SessionId::new(*b"LOCAL001"), tx);

        let outcome = router.route(Vec::new());
        assert!(outcome.local.is_empty());
        assert_eq!(outcome.relayed, 0);
        assert_eq!(outcome.dropped, 0);
    }
}
