//! Type definitions and protocol constants for the courier wire protocol.

use std::fmt;

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the packet nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Size of a symmetric key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a session identifier in bytes.
pub const SESSION_ID_SIZE: usize = 8;

/// Size of the routing header plaintext in bytes.
pub const ROUTING_HEADER_SIZE: usize = 16;

/// Size of the sealed routing header (header ciphertext + tag).
pub const SEALED_HEADER_SIZE: usize = ROUTING_HEADER_SIZE + TAG_SIZE;

/// Minimum size of a complete routing packet (nonce + sealed header).
pub const MIN_PACKET_SIZE: usize = NONCE_SIZE + SEALED_HEADER_SIZE;

/// Size of the task record header in bytes.
pub const TASK_HEADER_SIZE: usize = 12;

/// Size of the handshake confirmation nonce in bytes.
pub const HANDSHAKE_NONCE_SIZE: usize = 8;

/// Session key derivation salt.
pub const SESSION_KEY_SALT: &[u8] = b"courier-v1-session";

/// Session key derivation info prefix.
pub const SESSION_KEY_INFO_PREFIX: &[u8] = b"CourierV1-SessionKey";

/// Session identifier carried by packets sent before a session exists.
pub const PLACEHOLDER_SESSION_ID: [u8; SESSION_ID_SIZE] = *b"00000000";

/// Characters a controller-assigned session identifier is drawn from.
const SESSION_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Identifies one agent session for the lifetime of its key.
///
/// Agents start with [`SessionId::placeholder`] and receive their real
/// identifier from the controller during the handshake. The identifier is
/// eight ASCII characters and travels inside the sealed routing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Create a session ID from its raw bytes.
    pub fn new(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// The pre-handshake placeholder identifier.
    pub fn placeholder() -> Self {
        Self(PLACEHOLDER_SESSION_ID)
    }

    /// Generate a random identifier for a newly staged session.
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; SESSION_ID_SIZE];
        for b in bytes.iter_mut() {
            *b = SESSION_ID_CHARSET[rng.gen_range(0..SESSION_ID_CHARSET.len())];
        }
        Self(bytes)
    }

    /// Parse a session ID from a slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SESSION_ID_SIZE] = bytes.try_into().map_err(|_| {
            CourierError::MalformedPacket(format!(
                "session id must be {SESSION_ID_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Raw bytes as carried on the wire.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }

    /// Whether this is the pre-handshake placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.0 == PLACEHOLDER_SESSION_ID
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Long-lived key shared out of band between controller and agents.
///
/// Seals every routing header plus the handshake payloads that bootstrap
/// a session; payloads after staging run under the per-session key
/// derived from the exchange.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PreSharedKey([u8; KEY_SIZE]);

impl PreSharedKey {
    /// Wrap existing key bytes.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh key for controller setup.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a key from a slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CourierError::InvalidProfile(format!(
                "pre-shared key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PreSharedKey([redacted])")
    }
}

/// Ephemeral key protecting one session's traffic.
///
/// Derived exactly once per completed handshake and never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Wrap derived key bytes.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([redacted])")
    }
}

/// Which runtime family the sending agent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeKind {
    /// Not yet known (pre-staging traffic).
    None = 0,
    /// Compiled agent runtime.
    Native = 1,
    /// Script-hosted agent runtime.
    Script = 2,
}

impl RuntimeKind {
    /// Wire encoding of this kind.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for RuntimeKind {
    type Error = CourierError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Native),
            2 => Ok(Self::Script),
            other => Err(CourierError::UnknownRuntimeKind(other)),
        }
    }
}

/// What a routing packet's payload means to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// No payload semantics (keep-alive, padding).
    None = 0,
    /// First handshake step: agent offers its ephemeral public key.
    StagingRequest = 1,
    /// Second handshake step: agent confirms the derived session key.
    StagingResponse = 2,
    /// Agent asks for queued tasking.
    TaskingRequest = 3,
    /// Agent posts task results.
    ResultPost = 4,
    /// Controller-originated payload.
    ServerResponse = 5,
}

impl MessageKind {
    /// Wire encoding of this kind.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = CourierError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::StagingRequest),
            2 => Ok(Self::StagingResponse),
            3 => Ok(Self::TaskingRequest),
            4 => Ok(Self::ResultPost),
            5 => Ok(Self::ServerResponse),
            other => Err(CourierError::UnknownMessageKind(other)),
        }
    }
}

/// Errors that can occur during courier operations.
#[derive(Error, Debug)]
pub enum CourierError {
    // Cryptography Errors
    /// Authenticated decryption failed.
    ///
    /// Deliberately carries no detail: a forged tag and a wrong key are
    /// indistinguishable to the caller.
    #[error("Authentication failure")]
    AuthenticationFailure,

    /// Could not derive key material.
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The session's nonce counter ran out.
    #[error("Nonce counter exhausted for this session")]
    NonceExhausted,

    /// Payload does not fit a single envelope.
    #[error("Payload too large for one envelope: {0} bytes")]
    MessageTooLarge(usize),

    // Packet Errors
    /// Packet bytes are structurally invalid.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Header carried an unassigned runtime value.
    #[error("Unknown runtime kind: {0}")]
    UnknownRuntimeKind(u8),

    /// Header carried an unassigned message kind value.
    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u8),

    // Handshake Errors
    /// A handshake step failed; the attempt must restart from scratch.
    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    /// A handshake operation was invoked out of order.
    #[error("Wrong handshake phase: expected {expected}, got {actual}")]
    WrongPhase {
        expected: &'static str,
        actual: &'static str,
    },

    // Transport Errors
    /// The underlying transport could not complete an exchange.
    #[error("Transport failed: {0}")]
    TransportFailed(String),

    // Profile Errors
    /// Connection profile string could not be parsed.
    #[error("Invalid connection profile: {0}")]
    InvalidProfile(String),
}

pub type Result<T> = std::result::Result<T, CourierError>;
