//! Per-session payload sealing and nonce discipline.
//!
//! Payloads travel as self-contained `nonce || ciphertext || tag` blobs so
//! the routing layer can treat them as opaque bytes. Nonce uniqueness per
//! key is owned here; callers never pick nonces themselves.

use rand::RngCore;

use crate::aead;
use crate::types::{CourierError, Result, SessionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Which endpoint a counter nonce stream belongs to.
///
/// Both ends seal under the same session key, so their counter streams are
/// kept disjoint by a direction byte inside the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Agent-originated traffic.
    FromAgent,
    /// Controller-originated traffic.
    FromController,
}

impl Direction {
    fn as_byte(self) -> u8 {
        match self {
            Self::FromAgent => 0x00,
            Self::FromController => 0x01,
        }
    }
}

/// How a session chooses payload nonces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NonceMode {
    /// Fresh random nonce per seal. No state survives restarts, so this is
    /// the mode a controller can always resume under.
    #[default]
    Random,
    /// Monotonic counter plus the direction byte. Deterministic sequencing
    /// within one session lifetime.
    Counter,
}

/// Monotonic nonce source for [`NonceMode::Counter`].
#[derive(Debug)]
pub struct NonceSequence {
    counter: u64,
    direction: Direction,
}

impl NonceSequence {
    /// Start a sequence at zero for one direction.
    pub fn new(direction: Direction) -> Self {
        Self {
            counter: 0,
            direction,
        }
    }

    /// Produce the next nonce: counter little-endian in bytes 0..8, the
    /// direction byte at 8, zero tail. Errors once the counter space is
    /// spent rather than wrapping into reuse.
    pub fn advance(&mut self) -> Result<[u8; NONCE_SIZE]> {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        nonce[8] = self.direction.as_byte();
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CourierError::NonceExhausted)?;
        Ok(nonce)
    }
}

/// Seal a standalone message under `key` with a fresh random nonce.
///
/// Output layout: `nonce || ciphertext || tag`. Used for handshake traffic
/// that runs under the pre-shared key before any session exists.
pub fn seal_message(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut out = Vec::with_capacity(NONCE_SIZE + plaintext.len() + TAG_SIZE);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&aead::seal(key, &nonce, plaintext, b""));
    out
}

/// Open a standalone `nonce || ciphertext || tag` message.
pub fn open_message(key: &[u8; KEY_SIZE], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CourierError::MalformedPacket(format!(
            "sealed message too short: {} bytes",
            blob.len()
        )));
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&blob[..NONCE_SIZE]);
    aead::open(key, &nonce, &blob[NONCE_SIZE..], b"")
}

/// Seals and opens payloads for one established session.
pub struct SessionCrypto {
    key: SessionKey,
    mode: NonceMode,
    sequence: NonceSequence,
}

impl SessionCrypto {
    /// Bind a derived session key to a direction and nonce mode.
    pub fn new(key: SessionKey, direction: Direction, mode: NonceMode) -> Self {
        Self {
            key,
            mode,
            sequence: NonceSequence::new(direction),
        }
    }

    /// The session key in use.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Seal one payload; nonce choice follows the configured mode.
    pub fn seal_payload(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = match self.mode {
            NonceMode::Random => {
                let mut nonce = [0u8; NONCE_SIZE];
                rand::thread_rng().fill_bytes(&mut nonce);
                nonce
            }
            NonceMode::Counter => self.sequence.advance()?,
        };
        let mut out = Vec::with_capacity(NONCE_SIZE + plaintext.len() + TAG_SIZE);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&aead::seal(self.key.as_bytes(), &nonce, plaintext, b""));
        Ok(out)
    }

    /// Open one payload sealed by the peer.
    pub fn open_payload(&self, blob: &[u8]) -> Result<Vec<u8>> {
        open_message(self.key.as_bytes(), blob)
    }
}
