//! One-time polynomial MAC over GF(2^130 - 5).
//!
//! Second half of the packet seal. Keys come from the reserved keystream
//! block of the cipher and must never authenticate two messages.

use crate::types::TAG_SIZE;

/// Size of a one-time MAC key in bytes.
pub const MAC_KEY_SIZE: usize = 32;

/// 26-bit limb mask; limbs stay small enough that products fit in u64.
const LIMB_MASK: u32 = 0x03ff_ffff;

/// Incremental MAC state.
///
/// `update` may be called any number of times; `finalize` consumes the
/// state so a key cannot be reused by accident.
pub struct Poly1305 {
    r: [u32; 5],
    s: [u32; 4],
    h: [u32; 5],
    buffer: [u8; 16],
    buffered: usize,
}

impl Poly1305 {
    /// Initialize from a 32-byte one-time key: `r` (clamped) then `s`.
    pub fn new(key: &[u8; MAC_KEY_SIZE]) -> Self {
        // The clamp is folded into the limb masks
        let r = [
            le32(key, 0) & 0x03ff_ffff,
            (le32(key, 3) >> 2) & 0x03ff_ff03,
            (le32(key, 6) >> 4) & 0x03ff_c0ff,
            (le32(key, 9) >> 6) & 0x03f0_3fff,
            (le32(key, 12) >> 8) & 0x000f_ffff,
        ];
        let s = [le32(key, 16), le32(key, 20), le32(key, 24), le32(key, 28)];
        Self {
            r,
            s,
            h: [0u32; 5],
            buffer: [0u8; 16],
            buffered: 0,
        }
    }

    /// Absorb message bytes.
    pub fn update(&mut self, mut data: &[u8]) {
        if self.buffered > 0 {
            let take = (16 - self.buffered).min(data.len());
            self.buffer[self.buffered..self.buffered + take].copy_from_slice(&data[..take]);
            self.buffered += take;
            data = &data[take..];
            if self.buffered == 16 {
                let block = self.buffer;
                self.process_block(&block, 1 << 24);
                self.buffered = 0;
            }
        }

        while data.len() >= 16 {
            let mut block = [0u8; 16];
            block.copy_from_slice(&data[..16]);
            self.process_block(&block, 1 << 24);
            data = &data[16..];
        }

        if !data.is_empty() {
            self.buffer[..data.len()].copy_from_slice(data);
            self.buffered = data.len();
        }
    }

    /// Finish and produce the 16-byte tag.
    pub fn finalize(mut self) -> [u8; TAG_SIZE] {
        if self.buffered > 0 {
            // Partial block: append 0x01, zero-fill, no high bit
            let mut block = [0u8; 16];
            block[..self.buffered].copy_from_slice(&self.buffer[..self.buffered]);
            block[self.buffered] = 0x01;
            self.process_block(&block, 0);
        }

        let [mut h0, mut h1, mut h2, mut h3, mut h4] = self.h;

        // Fully reduce h
        let mut c;
        c = h1 >> 26;
        h1 &= LIMB_MASK;
        h2 += c;
        c = h2 >> 26;
        h2 &= LIMB_MASK;
        h3 += c;
        c = h3 >> 26;
        h3 &= LIMB_MASK;
        h4 += c;
        c = h4 >> 26;
        h4 &= LIMB_MASK;
        h0 += c * 5;
        c = h0 >> 26;
        h0 &= LIMB_MASK;
        h1 += c;

        // g = h + 5 - 2^130; select g when h >= p, without branching on h
        let mut g0 = h0.wrapping_add(5);
        c = g0 >> 26;
        g0 &= LIMB_MASK;
        let mut g1 = h1.wrapping_add(c);
        c = g1 >> 26;
        g1 &= LIMB_MASK;
        let mut g2 = h2.wrapping_add(c);
        c = g2 >> 26;
        g2 &= LIMB_MASK;
        let mut g3 = h3.wrapping_add(c);
        c = g3 >> 26;
        g3 &= LIMB_MASK;
        let g4 = h4.wrapping_add(c).wrapping_sub(1 << 26);

        let mask = (g4 >> 31).wrapping_sub(1);
        h0 = (h0 & !mask) | (g0 & mask);
        h1 = (h1 & !mask) | (g1 & mask);
        h2 = (h2 & !mask) | (g2 & mask);
        h3 = (h3 & !mask) | (g3 & mask);
        h4 = (h4 & !mask) | (g4 & mask);

        // Repack 26-bit limbs into 32-bit words (mod 2^128)
        let t0 = h0 | (h1 << 26);
        let t1 = (h1 >> 6) | (h2 << 20);
        let t2 = (h2 >> 12) | (h3 << 14);
        let t3 = (h3 >> 18) | (h4 << 8);

        // tag = (h + s) mod 2^128
        let mut f;
        let mut tag = [0u8; TAG_SIZE];
        f = t0 as u64 + self.s[0] as u64;
        tag[0..4].copy_from_slice(&(f as u32).to_le_bytes());
        f = t1 as u64 + self.s[1] as u64 + (f >> 32);
        tag[4..8].copy_from_slice(&(f as u32).to_le_bytes());
        f = t2 as u64 + self.s[2] as u64 + (f >> 32);
        tag[8..12].copy_from_slice(&(f as u32).to_le_bytes());
        f = t3 as u64 + self.s[3] as u64 + (f >> 32);
        tag[12..16].copy_from_slice(&(f as u32).to_le_bytes());
        tag
    }

    fn process_block(&mut self, block: &[u8; 16], hibit: u32) {
        let [r0, r1, r2, r3, r4] = self.r;
        // Precomputed 5*r for the mod 2^130-5 fold
        let x1 = r1 * 5;
        let x2 = r2 * 5;
        let x3 = r3 * 5;
        let x4 = r4 * 5;

        let h0 = (self.h[0] + (le32(block, 0) & LIMB_MASK)) as u64;
        let h1 = (self.h[1] + ((le32(block, 3) >> 2) & LIMB_MASK)) as u64;
        let h2 = (self.h[2] + ((le32(block, 6) >> 4) & LIMB_MASK)) as u64;
        let h3 = (self.h[3] + ((le32(block, 9) >> 6) & LIMB_MASK)) as u64;
        let h4 = (self.h[4] + ((le32(block, 12) >> 8) | hibit)) as u64;

        let d0 = h0 * r0 as u64 + h1 * x4 as u64 + h2 * x3 as u64 + h3 * x2 as u64 + h4 * x1 as u64;
        let mut d1 =
            h0 * r1 as u64 + h1 * r0 as u64 + h2 * x4 as u64 + h3 * x3 as u64 + h4 * x2 as u64;
        let mut d2 =
            h0 * r2 as u64 + h1 * r1 as u64 + h2 * r0 as u64 + h3 * x4 as u64 + h4 * x3 as u64;
        let mut d3 =
            h0 * r3 as u64 + h1 * r2 as u64 + h2 * r1 as u64 + h3 * r0 as u64 + h4 * x4 as u64;
        let mut d4 =
            h0 * r4 as u64 + h1 * r3 as u64 + h2 * r2 as u64 + h3 * r1 as u64 + h4 * r0 as u64;

        let mut c;
        c = d0 >> 26;
        self.h[0] = d0 as u32 & LIMB_MASK;
        d1 += c;
        c = d1 >> 26;
        self.h[1] = d1 as u32 & LIMB_MASK;
        d2 += c;
        c = d2 >> 26;
        self.h[2] = d2 as u32 & LIMB_MASK;
        d3 += c;
        c = d3 >> 26;
        self.h[3] = d3 as u32 & LIMB_MASK;
        d4 += c;
        c = d4 >> 26;
        self.h[4] = d4 as u32 & LIMB_MASK;
        self.h[0] += (c as u32) * 5;
        c = (self.h[0] >> 26) as u64;
        self.h[0] &= LIMB_MASK;
        self.h[1] += c as u32;
    }
}

/// One-shot MAC over a byte string.
pub fn mac(key: &[u8; MAC_KEY_SIZE], data: &[u8]) -> [u8; TAG_SIZE] {
    let mut state = Poly1305::new(key);
    state.update(data);
    state.finalize()
}

#[inline(always)]
fn le32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
