//! Key exchange and session key derivation.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::types::{
    CourierError, PreSharedKey, Result, SessionId, SessionKey, KEY_SIZE, SESSION_KEY_INFO_PREFIX,
    SESSION_KEY_SALT,
};

/// Generate a random ephemeral X25519 key pair for one handshake.
///
/// # Returns
/// Tuple of (private_key, public_key)
pub fn generate_ephemeral_keypair() -> (StaticSecret, PublicKey) {
    let private_key = StaticSecret::random_from_rng(rand::thread_rng());
    let public_key = PublicKey::from(&private_key);
    (private_key, public_key)
}

/// Perform X25519 ECDH key exchange.
///
/// # Arguments
/// * `private_key` - Our private key
/// * `public_key` - Their public key
///
/// # Returns
/// 32-byte shared secret
pub fn x25519_ecdh(private_key: &StaticSecret, public_key: &PublicKey) -> [u8; 32] {
    private_key.diffie_hellman(public_key).to_bytes()
}

/// Derive the session key for a completed exchange using HKDF-SHA256.
///
/// Input keying material is the ECDH shared secret concatenated with the
/// pre-shared key; the info string carries both ephemeral public keys and
/// the assigned session ID. Called exactly once per handshake.
///
/// # Arguments
/// * `shared_secret` - X25519 shared secret for this exchange
/// * `psk` - Long-lived pre-shared key
/// * `agent_public` - Agent's ephemeral public key
/// * `controller_public` - Controller's ephemeral public key
/// * `session_id` - Controller-assigned session ID
///
/// # Returns
/// The 32-byte session key
pub fn derive_session_key(
    shared_secret: &[u8; 32],
    psk: &PreSharedKey,
    agent_public: &PublicKey,
    controller_public: &PublicKey,
    session_id: &SessionId,
) -> Result<SessionKey> {
    let mut ikm = [0u8; KEY_SIZE * 2];
    ikm[..KEY_SIZE].copy_from_slice(shared_secret);
    ikm[KEY_SIZE..].copy_from_slice(psk.as_bytes());

    // Build info: prefix + agent pubkey + controller pubkey + session id
    let mut info = Vec::with_capacity(SESSION_KEY_INFO_PREFIX.len() + 72);
    info.extend_from_slice(SESSION_KEY_INFO_PREFIX);
    info.extend_from_slice(agent_public.as_bytes());
    info.extend_from_slice(controller_public.as_bytes());
    info.extend_from_slice(session_id.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(SESSION_KEY_SALT), &ikm);
    let mut key = [0u8; KEY_SIZE];
    let expanded = hkdf
        .expand(&info, &mut key)
        .map_err(|e| CourierError::KeyDerivationFailed(format!("HKDF expand failed: {}", e)));
    ikm.zeroize();
    expanded?;

    Ok(SessionKey::new(key))
}
