//! Arithmetic over the prime field GF(2^32 - 5) and the mapping between
//! arbitrary bytes and vectors of field elements.
//!
//! Bytes are read as big-endian 32-bit words. The handful of words that are
//! not valid field elements (the top five values) are avoided by XORing every
//! word with a per-object mask, the "mapping value", which is saved alongside
//! the object so the transformation can be undone.

mod matrix;

pub use matrix::*;

/// The field modulus, `2^32 - 5`.
pub const GF_MAX_VAL: u32 = 4_294_967_291;

const FIRST_MASK: u32 = 1 << 31;

#[inline]
pub fn gf_add(a: u32, b: u32) -> u32 {
    ((a as u64 + b as u64) % GF_MAX_VAL as u64) as u32
}

#[inline]
pub fn gf_sub(a: u32, b: u32) -> u32 {
    ((a as u64 + GF_MAX_VAL as u64 - b as u64) % GF_MAX_VAL as u64) as u32
}

#[inline]
pub fn gf_mul(a: u32, b: u32) -> u32 {
    ((a as u64 * b as u64) % GF_MAX_VAL as u64) as u32
}

pub fn gf_pow(mut base: u32, mut exp: u64) -> u32 {
    let mut result = 1u32;
    base %= GF_MAX_VAL;
    while exp > 0 {
        if exp & 1 == 1 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}

/// Multiplicative inverse by Fermat's little theorem. Zero has no inverse and
/// maps to zero; callers check for singular pivots before inverting.
pub fn gf_inv(a: u32) -> u32 {
    gf_pow(a, GF_MAX_VAL as u64 - 2)
}

fn all_valid(words: &[u32], mask: u32) -> bool {
    words.iter().all(|w| (w ^ mask) < GF_MAX_VAL)
}

/// Map bytes to field elements. Returns the mapping value and the words.
pub fn map_to_gf(data: &[u8]) -> (u32, Vec<u32>) {
    let mut words: Vec<u32> = data
        .chunks(4)
        .map(|c| {
            let mut buf = [0u8; 4];
            buf[..c.len()].copy_from_slice(c);
            u32::from_be_bytes(buf)
        })
        .collect();

    if all_valid(&words, 0) {
        return (0, words);
    }

    let mut mask = FIRST_MASK;
    while !all_valid(&words, mask) {
        mask = rand::random::<u32>();
    }
    for w in words.iter_mut() {
        *w ^= mask;
    }
    (mask, words)
}

/// Undo [`map_to_gf`]. The result is a whole number of words; the caller
/// truncates it to the original length.
pub fn map_from_gf(mapping: u32, words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&(w ^ mapping).to_be_bytes());
    }
    out
}

/// Read stored chunk bytes back into field elements.
pub fn words_from_stored(mapping: u32, data: &[u8]) -> Vec<u32> {
    data.chunks(4)
        .map(|c| {
            let mut buf = [0u8; 4];
            buf[..c.len()].copy_from_slice(c);
            u32::from_be_bytes(buf) ^ mapping
        })
        .collect()
}
