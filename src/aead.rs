//! Authenticated sealing built from the stream cipher and the one-time MAC.
//!
//! `sealed = ciphertext || tag`: keystream from block 1 onward encrypts,
//! block 0 keys the MAC, and the tag covers `aad || ciphertext` with their
//! lengths. `open` fails closed; a bad tag never releases plaintext.

use subtle::ConstantTimeEq;

use crate::chacha20;
use crate::poly1305::{Poly1305, MAC_KEY_SIZE};
use crate::types::{CourierError, Result, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

const ZERO_PAD: [u8; 16] = [0u8; 16];

/// Encrypt and authenticate `plaintext`.
///
/// # Arguments
/// * `key` - 256-bit key
/// * `nonce` - 96-bit nonce, single-use under this key
/// * `plaintext` - Data to protect
/// * `aad` - Additional data bound into the tag but not encrypted
///
/// # Returns
/// Ciphertext with the 16-byte tag appended
pub fn seal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
    out.extend_from_slice(plaintext);
    chacha20::apply_keystream(key, nonce, 1, &mut out);
    let tag = compute_tag(key, nonce, aad, &out);
    out.extend_from_slice(&tag);
    out
}

/// Verify and decrypt `sealed` (ciphertext plus trailing tag).
///
/// Tag comparison is constant-time. Returns
/// [`CourierError::AuthenticationFailure`] on any mismatch; the error is
/// identical for a wrong key, a wrong nonce, altered ciphertext and
/// altered additional data.
pub fn open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if sealed.len() < TAG_SIZE {
        return Err(CourierError::MalformedPacket(format!(
            "sealed data too short: {} bytes",
            sealed.len()
        )));
    }
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

    let expected = compute_tag(key, nonce, aad, ciphertext);
    if !bool::from(expected[..].ct_eq(tag)) {
        return Err(CourierError::AuthenticationFailure);
    }

    let mut plaintext = ciphertext.to_vec();
    chacha20::apply_keystream(key, nonce, 1, &mut plaintext);
    Ok(plaintext)
}

/// MAC key is the first half of reserved keystream block 0.
fn one_time_mac_key(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE]) -> [u8; MAC_KEY_SIZE] {
    let block = chacha20::block(key, 0, nonce);
    let mut mac_key = [0u8; MAC_KEY_SIZE];
    mac_key.copy_from_slice(&block[..MAC_KEY_SIZE]);
    mac_key
}

fn compute_tag(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> [u8; TAG_SIZE] {
    let mut mac = Poly1305::new(&one_time_mac_key(key, nonce));
    mac.update(aad);
    mac.update(pad16(aad.len()));
    mac.update(ciphertext);
    mac.update(pad16(ciphertext.len()));
    mac.update(&(aad.len() as u64).to_le_bytes());
    mac.update(&(ciphertext.len() as u64).to_le_bytes());
    mac.finalize()
}

fn pad16(len: usize) -> &'static [u8] {
    &ZERO_PAD[..(16 - len % 16) % 16]
}
