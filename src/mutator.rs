//! Byte-level mutation operators.
//!
//! Every operator is total over arbitrary input bytes and never produces an
//! output longer than the configured cap. The composite `havoc` stacks
//! randomly chosen primitives; `splice` crosses two parents and finishes with
//! one havoc pass. All randomness flows through the caller's ChaCha RNG so
//! runs are reproducible from a seed.

use rand_chacha::ChaCha20Rng;
use rand_core::RngCore as _;

/// AFL "interesting" 8-bit values.
const INTERESTING_8: [u8; 5] = [0x00, 0x01, 0x7F, 0x80, 0xFF];
/// AFL "interesting" 16-bit values, written in either endianness.
const INTERESTING_16: [u16; 5] = [0x0000, 0x0001, 0x7FFF, 0x8000, 0xFFFF];
/// AFL "interesting" 32-bit values, written in either endianness.
const INTERESTING_32: [u32; 4] = [0x0000_0000, 0x7FFF_FFFF, 0x8000_0000, 0xFFFF_FFFF];

const MAX_ARITH_DELTA: u64 = 35;
const MAX_INSERT_RUN: usize = 32;
const MAX_DELETE_RUN: usize = 32;

/// Closed set of mutation strategies; `mutate` dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStrategy {
    BitFlip,
    ByteFlip,
    Arithmetic,
    Interesting,
    Insert,
    Delete,
    Havoc,
    Splice,
}

/// Knobs shared by the dispatch wrapper.
#[derive(Debug, Clone, Copy)]
pub struct MutatorConfig {
    pub max_seed_size: usize,
    pub havoc_iterations: u32,
    pub flip_count: u32,
}

impl MutatorConfig {
    pub fn new(max_seed_size: usize, havoc_iterations: u32) -> Self {
        Self {
            max_seed_size,
            havoc_iterations,
            flip_count: 1,
        }
    }
}

/// Dispatch wrapper over all strategies. `other` supplies the second parent
/// for `Splice`; without one, splice degrades to a plain havoc pass.
pub fn mutate(
    data: &[u8],
    strategy: MutationStrategy,
    other: Option<&[u8]>,
    rng: &mut ChaCha20Rng,
    cfg: &MutatorConfig,
) -> Vec<u8> {
    let mut buf = data.to_vec();
    match strategy {
        MutationStrategy::BitFlip => bit_flip(&mut buf, cfg.flip_count, rng),
        MutationStrategy::ByteFlip => byte_flip(&mut buf, cfg.flip_count, rng),
        MutationStrategy::Arithmetic => arithmetic(&mut buf, rng),
        MutationStrategy::Interesting => interesting_values(&mut buf, rng),
        MutationStrategy::Insert => insert(&mut buf, cfg.max_seed_size, rng),
        MutationStrategy::Delete => delete(&mut buf, rng),
        MutationStrategy::Havoc => havoc(&mut buf, cfg.havoc_iterations, cfg.max_seed_size, rng),
        MutationStrategy::Splice => match other {
            Some(other) => return splice(data, other, rng, cfg),
            None => havoc(&mut buf, cfg.havoc_iterations, cfg.max_seed_size, rng),
        },
    }
    buf.truncate(cfg.max_seed_size);
    buf
}

/// Flip `count` randomly chosen bits. Identity on empty input.
pub fn bit_flip(buf: &mut [u8], count: u32, rng: &mut ChaCha20Rng) {
    if buf.is_empty() {
        return;
    }
    for _ in 0..count {
        let bit = rand_below(rng, buf.len() * 8);
        buf[bit / 8] ^= 1 << (bit % 8);
    }
}

/// XOR `count` randomly chosen bytes with 0xFF. Identity on empty input.
pub fn byte_flip(buf: &mut [u8], count: u32, rng: &mut ChaCha20Rng) {
    if buf.is_empty() {
        return;
    }
    for _ in 0..count {
        let idx = rand_below(rng, buf.len());
        buf[idx] ^= 0xFF;
    }
}

/// Add a delta in [-35, +35] \ {0} to one byte, wrapping mod 256.
pub fn arithmetic(buf: &mut [u8], rng: &mut ChaCha20Rng) {
    if buf.is_empty() {
        return;
    }
    let idx = rand_below(rng, buf.len());
    let delta = 1 + (rng.next_u64() % MAX_ARITH_DELTA) as u8;
    if rng.next_u64() & 1 == 0 {
        buf[idx] = buf[idx].wrapping_add(delta);
    } else {
        buf[idx] = buf[idx].wrapping_sub(delta);
    }
}

/// Overwrite a random 1/2/4-byte window with an AFL interesting value,
/// multi-byte widths in a randomly chosen endianness.
pub fn interesting_values(buf: &mut [u8], rng: &mut ChaCha20Rng) {
    if buf.is_empty() {
        return;
    }

    let mut widths = [1usize; 3];
    let mut n = 1;
    if buf.len() >= 2 {
        widths[n] = 2;
        n += 1;
    }
    if buf.len() >= 4 {
        widths[n] = 4;
        n += 1;
    }
    let width = widths[rand_below(rng, n)];
    let pos = rand_below(rng, buf.len() - width + 1);
    let big_endian = rng.next_u64() & 1 == 0;

    match width {
        1 => {
            buf[pos] = INTERESTING_8[rand_below(rng, INTERESTING_8.len())];
        }
        2 => {
            let val = INTERESTING_16[rand_below(rng, INTERESTING_16.len())];
            let bytes = if big_endian { val.to_be_bytes() } else { val.to_le_bytes() };
            buf[pos..pos + 2].copy_from_slice(&bytes);
        }
        _ => {
            let val = INTERESTING_32[rand_below(rng, INTERESTING_32.len())];
            let bytes = if big_endian { val.to_be_bytes() } else { val.to_le_bytes() };
            buf[pos..pos + 4].copy_from_slice(&bytes);
        }
    }
}

/// Insert a run of 1..=32 random bytes at a random position, clamped so the
/// result never exceeds `max_len`.
pub fn insert(buf: &mut Vec<u8>, max_len: usize, rng: &mut ChaCha20Rng) {
    if buf.len() >= max_len {
        return;
    }
    let run = (1 + rand_below(rng, MAX_INSERT_RUN)).min(max_len - buf.len());
    let pos = rand_below(rng, buf.len() + 1);
    let fresh: Vec<u8> = (0..run).map(|_| (rng.next_u64() & 0xFF) as u8).collect();
    buf.splice(pos..pos, fresh);
}

/// Remove a run of 1..=min(32, len/2) bytes at a random position. No-op on
/// inputs shorter than two bytes.
pub fn delete(buf: &mut Vec<u8>, rng: &mut ChaCha20Rng) {
    if buf.len() < 2 {
        return;
    }
    let run = 1 + rand_below(rng, MAX_DELETE_RUN.min(buf.len() / 2));
    let pos = rand_below(rng, buf.len() - run + 1);
    buf.drain(pos..pos + run);
}

/// Stacked random mutation: `iterations` rounds, each applying one primitive
/// chosen uniformly, the output of one round feeding the next.
pub fn havoc(buf: &mut Vec<u8>, iterations: u32, max_len: usize, rng: &mut ChaCha20Rng) {
    for _ in 0..iterations {
        match rng.next_u64() % 6 {
            0 => bit_flip(buf, 1, rng),
            1 => byte_flip(buf, 1, rng),
            2 => arithmetic(buf, rng),
            3 => interesting_values(buf, rng),
            4 => insert(buf, max_len, rng),
            _ => delete(buf, rng),
        }
    }
    buf.truncate(max_len);
}

/// Two-parent crossover: a prefix of `d1` glued to a suffix of `d2`, then one
/// havoc pass over the child.
pub fn splice(d1: &[u8], d2: &[u8], rng: &mut ChaCha20Rng, cfg: &MutatorConfig) -> Vec<u8> {
    let mut child = splice_concat(d1, d2, rng);
    child.truncate(cfg.max_seed_size);
    havoc(&mut child, cfg.havoc_iterations, cfg.max_seed_size, rng);
    child
}

fn splice_concat(d1: &[u8], d2: &[u8], rng: &mut ChaCha20Rng) -> Vec<u8> {
    let s1 = rand_below(rng, d1.len() + 1);
    let s2 = rand_below(rng, d2.len() + 1);
    let mut out = Vec::with_capacity(s1 + (d2.len() - s2));
    out.extend_from_slice(&d1[..s1]);
    out.extend_from_slice(&d2[s2..]);
    out
}

fn rand_below(rng: &mut ChaCha20Rng, n: usize) -> usize {
    debug_assert!(n > 0);
    (rng.next_u64() % n as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::SeedableRng as _;

    fn rng(seed: u64) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(seed)
    }

    const CFG: MutatorConfig = MutatorConfig {
        max_seed_size: 64,
        havoc_iterations: 8,
        flip_count: 1,
    };

    #[test]
    fn bit_flip_changes_exactly_one_bit() {
        let mut r = rng(1);
        let original = vec![0u8; 16];
        let mut buf = original.clone();
        bit_flip(&mut buf, 1, &mut r);
        let flipped: u32 = buf
            .iter()
            .zip(&original)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        assert_eq!(flipped, 1);
    }

    #[test]
    fn empty_input_ops_are_identity_except_insert() {
        let mut r = rng(2);
        for strategy in [
            MutationStrategy::BitFlip,
            MutationStrategy::ByteFlip,
            MutationStrategy::Arithmetic,
            MutationStrategy::Interesting,
            MutationStrategy::Delete,
        ] {
            assert!(mutate(&[], strategy, None, &mut r, &CFG).is_empty(), "{strategy:?}");
        }
        let grown = mutate(&[], MutationStrategy::Insert, None, &mut r, &CFG);
        assert!(!grown.is_empty());
    }

    #[test]
    fn every_strategy_respects_the_size_cap() {
        let mut r = rng(3);
        let data: Vec<u8> = (0..60).map(|i| i as u8).collect();
        let other: Vec<u8> = (0..60).map(|i| (i * 3) as u8).collect();
        for _ in 0..200 {
            for strategy in [
                MutationStrategy::BitFlip,
                MutationStrategy::ByteFlip,
                MutationStrategy::Arithmetic,
                MutationStrategy::Interesting,
                MutationStrategy::Insert,
                MutationStrategy::Delete,
                MutationStrategy::Havoc,
                MutationStrategy::Splice,
            ] {
                let out = mutate(&data, strategy, Some(&other), &mut r, &CFG);
                assert!(out.len() <= CFG.max_seed_size, "{strategy:?} overflowed");
            }
        }
    }

    #[test]
    fn delete_is_noop_below_two_bytes() {
        let mut r = rng(4);
        let mut one = vec![0x41];
        delete(&mut one, &mut r);
        assert_eq!(one, vec![0x41]);
    }

    #[test]
    fn splice_concat_keeps_prefix_and_suffix() {
        let d1: Vec<u8> = (0..32).collect();
        let d2: Vec<u8> = (100..140).collect();
        for seed in 0..64 {
            let mut r = rng(seed);
            let out = splice_concat(&d1, &d2, &mut r);
            let from_d1 = out.iter().take_while(|b| **b < 100).count();
            assert_eq!(&out[..from_d1], &d1[..from_d1]);
            let tail = &out[from_d1..];
            assert_eq!(tail, &d2[d2.len() - tail.len()..]);
        }
    }

    #[test]
    fn havoc_is_reproducible_from_the_seed() {
        let data: Vec<u8> = (0..40).collect();
        let mut a = data.clone();
        let mut b = data;
        havoc(&mut a, 16, 64, &mut rng(7));
        havoc(&mut b, 16, 64, &mut rng(7));
        assert_eq!(a, b);
    }
}
