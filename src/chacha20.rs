//! 20-round stream cipher underlying the packet seal.
//!
//! Implements the RFC 8439 block function directly: the sealed formats this
//! crate speaks are defined in terms of these exact blocks, so the primitive
//! is owned here rather than pulled in behind a trait.

use crate::types::{KEY_SIZE, NONCE_SIZE};

/// Size of one keystream block in bytes.
pub const BLOCK_SIZE: usize = 64;

/// State words 0-3, the ASCII constants "expa" "nd 3" "2-by" "te k".
const SIGMA: [u32; 4] = [0x6170_7865, 0x3320_646e, 0x7962_2d32, 0x6b20_6574];

#[inline(always)]
fn quarter_round(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(16);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(12);
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(8);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(7);
}

fn init_state(key: &[u8; KEY_SIZE], counter: u32, nonce: &[u8; NONCE_SIZE]) -> [u32; 16] {
    let mut state = [0u32; 16];
    state[..4].copy_from_slice(&SIGMA);
    for i in 0..8 {
        state[4 + i] = u32::from_le_bytes([
            key[4 * i],
            key[4 * i + 1],
            key[4 * i + 2],
            key[4 * i + 3],
        ]);
    }
    state[12] = counter;
    for i in 0..3 {
        state[13 + i] = u32::from_le_bytes([
            nonce[4 * i],
            nonce[4 * i + 1],
            nonce[4 * i + 2],
            nonce[4 * i + 3],
        ]);
    }
    state
}

/// Produce one 64-byte keystream block.
///
/// # Arguments
/// * `key` - 256-bit cipher key
/// * `counter` - Block counter (counter 0 is reserved for the MAC subkey)
/// * `nonce` - 96-bit nonce
///
/// # Returns
/// The keystream block, serialized little-endian word by word
pub fn block(key: &[u8; KEY_SIZE], counter: u32, nonce: &[u8; NONCE_SIZE]) -> [u8; BLOCK_SIZE] {
    let initial = init_state(key, counter, nonce);
    let mut working = initial;

    // 10 double rounds: four column quarter rounds, then four diagonal ones
    for _ in 0..10 {
        quarter_round(&mut working, 0, 4, 8, 12);
        quarter_round(&mut working, 1, 5, 9, 13);
        quarter_round(&mut working, 2, 6, 10, 14);
        quarter_round(&mut working, 3, 7, 11, 15);
        quarter_round(&mut working, 0, 5, 10, 15);
        quarter_round(&mut working, 1, 6, 11, 12);
        quarter_round(&mut working, 2, 7, 8, 13);
        quarter_round(&mut working, 3, 4, 9, 14);
    }

    let mut out = [0u8; BLOCK_SIZE];
    for i in 0..16 {
        let word = working[i].wrapping_add(initial[i]);
        out[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// XOR keystream into `data` in place, starting at `initial_counter`.
///
/// Encryption and decryption are the same operation. Packet sealing starts
/// at counter 1; the final block is truncated to the data length.
pub fn apply_keystream(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    initial_counter: u32,
    data: &mut [u8],
) {
    for (block_index, chunk) in data.chunks_mut(BLOCK_SIZE).enumerate() {
        let counter = initial_counter.wrapping_add(block_index as u32);
        let keystream = block(key, counter, nonce);
        for (byte, k) in chunk.iter_mut().zip(keystream.iter()) {
            *byte ^= k;
        }
    }
}
