//! Courier - staged agent messaging over arbitrary transports
//!
//! Sealed routing envelopes, fragment framing and a staged X25519 +
//! ChaCha20-Poly1305 handshake for agent/controller sessions that share
//! and relay over one transport channel.

pub mod types;

pub mod chacha20;
pub mod poly1305;

pub mod aead;
pub mod keys;
pub mod session;

pub mod routing;
pub mod tasking;

pub mod handshake;
pub mod router;
pub mod transport;

pub mod agent;
pub mod profile;

pub use types::*;

pub use agent::{AgentConfig, AgentSession, PollReport, TaskDispatch};
pub use handshake::{
    AgentHandshake, ControllerHandshake, HandshakePhase, HostFingerprint, SessionRecord,
    SessionTable,
};
pub use profile::ConnectionProfile;
pub use router::{RelayFrame, RouteOutcome, SessionRouter};
pub use routing::{ParsedPacket, RoutingHeader};
pub use session::{Direction, NonceMode, SessionCrypto};
pub use tasking::{FragmentAnomaly, TaskPacket};
pub use transport::{LoopbackPeer, LoopbackTransport, Transport, TransportWorker};
