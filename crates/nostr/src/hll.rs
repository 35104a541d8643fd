//! NIP-45 HyperLogLog-assisted COUNT aggregation.
//!
//! The offset derivation below resolves an ambiguity the design notes flag
//! as unspecified ("character position 64 of the target hex" has no
//! zero-indexed meaning for a 64-character hex string): this implementation
//! treats it as the last nibble of the target's 64-hex-character form
//! (1-indexed position 64 == 0-indexed index 63), giving a value in
//! `0..=15` that is then shifted into the documented `[8, 23]` range.

use sha2::{Digest, Sha256};

const REGISTER_COUNT: usize = 256;

#[derive(Debug, Clone)]
pub struct Hll {
    offset: usize,
    registers: [u8; REGISTER_COUNT],
}

impl Hll {
    pub fn new(offset: usize) -> Self {
        assert!((8..=23).contains(&offset), "hll offset must be in [8, 23]");
        Self { offset, registers: [0u8; REGISTER_COUNT] }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn registers(&self) -> &[u8; REGISTER_COUNT] {
        &self.registers
    }

    /// Adds one 32-byte pubkey to the sketch.
    pub fn add_pubkey(&mut self, pubkey: &[u8; 32]) {
        let register_index = pubkey[self.offset] as usize;
        let tail = &pubkey[self.offset + 1..31];
        let rho = 1 + leading_zero_bits(tail);
        let slot = &mut self.registers[register_index];
        *slot = (*slot).max(rho);
    }

    /// Merges another sketch with the same offset by taking per-register
    /// maxima.
    pub fn merge(&mut self, other: &Hll) {
        assert_eq!(self.offset, other.offset, "cannot merge HLLs with different offsets");
        for (a, b) in self.registers.iter_mut().zip(other.registers.iter()) {
            *a = (*a).max(*b);
        }
    }

    pub fn estimate(&self) -> f64 {
        let m = REGISTER_COUNT as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self.registers.iter().map(|&r| 2f64.powi(-(r as i32))).sum();
        let raw = alpha * m * m / sum;

        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count();
            if zeros > 0 {
                return m * (m / zeros as f64).ln();
            }
        }
        raw
    }
}

fn leading_zero_bits(bytes: &[u8]) -> u8 {
    let mut count = 0u8;
    for &byte in bytes {
        if byte == 0 {
            count += 8;
            continue;
        }
        count += byte.leading_zeros() as u8;
        break;
    }
    count
}

/// Derives the register offset for a filter's single named-tag target
/// value, per the rule documented on [`Hll`].
pub fn derive_offset(target_value: &str) -> usize {
    let hex = if is_64_hex(target_value) {
        target_value.to_string()
    } else {
        let pubkey_from_address = target_value.split(':').nth(1).filter(|s| is_64_hex(s));
        match pubkey_from_address {
            Some(pubkey) => pubkey.to_string(),
            None => {
                let mut hasher = Sha256::new();
                hasher.update(target_value.as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    };
    let last_nibble = hex.chars().last().and_then(|c| c.to_digit(16)).unwrap_or(0) as usize;
    8 + last_nibble
}

fn is_64_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Decodes a 64-hex-character pubkey string into its 32 raw bytes.
pub fn pubkey_bytes(pubkey_hex: &str) -> Option<[u8; 32]> {
    let decoded = hex::decode(pubkey_hex).ok()?;
    decoded.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_within_documented_range() {
        let offset = derive_offset("deadbeef".repeat(8).as_str());
        assert!((8..=23).contains(&offset));
    }

    #[test]
    fn empty_sketch_estimates_near_zero() {
        let hll = Hll::new(8);
        assert!(hll.estimate() < 1.0);
    }

    #[test]
    fn adding_distinct_pubkeys_increases_estimate() {
        let offset = 8;
        let mut hll = Hll::new(offset);
        for i in 0u8..50 {
            let mut bytes = [0u8; 32];
            bytes[0] = i;
            bytes[31] = i.wrapping_mul(7);
            hll.add_pubkey(&bytes);
        }
        assert!(hll.estimate() > 1.0);
    }

    #[test]
    fn merge_takes_per_register_maxima() {
        let mut a = Hll::new(8);
        let mut b = Hll::new(8);
        a.add_pubkey(&[1u8; 32]);
        b.add_pubkey(&[2u8; 32]);
        let before = a.estimate();
        a.merge(&b);
        assert!(a.estimate() >= before);
    }
}
