//! Deterministic key derivation used by the hash index probe function.
//!
//! A [`Keystream`] is a reproducible sequence of 63-bit draws seeded from a
//! string. [`avalanche`] mixes a key's hash against its own keystream, and
//! [`damm_digit`] turns the result into the small step value that perturbs
//! the quadratic part of the probe sequence.

use core::fmt::Display;
use core::fmt::Write;

use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::Digest;
use sha2::Sha256;

/// Rotate-XOR rounds applied by [`avalanche`].
pub const KEYSTREAM_ROUNDS: usize = 7;

const MASK_63: u64 = i64::MAX as u64;

/// Damm quasigroup of order 10 (weakly totally anti-symmetric).
const DAMM: [[u8; 10]; 10] = [
    [0, 3, 1, 7, 5, 9, 8, 6, 4, 2],
    [7, 0, 9, 2, 1, 5, 4, 8, 6, 3],
    [4, 2, 0, 6, 8, 7, 1, 3, 5, 9],
    [1, 7, 5, 0, 9, 8, 3, 4, 2, 6],
    [6, 1, 2, 3, 0, 4, 5, 9, 7, 8],
    [3, 6, 7, 4, 2, 0, 9, 5, 8, 1],
    [5, 8, 6, 9, 7, 2, 0, 1, 3, 4],
    [8, 9, 4, 5, 3, 6, 2, 0, 1, 7],
    [9, 4, 3, 8, 6, 1, 7, 2, 0, 5],
    [2, 5, 8, 1, 4, 3, 6, 7, 9, 0],
];

struct DigestWriter<'a>(&'a mut Sha256);

impl Write for DigestWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.update(s.as_bytes());
        Ok(())
    }
}

/// A reproducible stream of 63-bit values.
///
/// Two keystreams built from the same seed yield identical sequences.
#[derive(Clone)]
pub struct Keystream {
    rng: ChaCha8Rng,
}

impl Keystream {
    /// Seeds a keystream from the SHA-256 digest of `seed`.
    pub fn from_str_seed(seed: &str) -> Self {
        Self::from_digest(Sha256::new_with_prefix(seed.as_bytes()))
    }

    /// Seeds a keystream from the `Display` form of `seed`, without
    /// materializing the string.
    pub fn from_display(seed: &impl Display) -> Self {
        let mut digest = Sha256::new();
        // `DigestWriter` never fails, so an error here is a broken `Display`.
        let written = write!(DigestWriter(&mut digest), "{seed}");
        debug_assert!(written.is_ok(), "Display impl returned an error");
        Self::from_digest(digest)
    }

    /// Seeds a keystream from a 64-bit value.
    pub fn from_u64(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn from_digest(digest: Sha256) -> Self {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest.finalize());
        Self {
            rng: ChaCha8Rng::from_seed(seed),
        }
    }

    /// Returns the next non-negative 63-bit draw.
    #[inline]
    pub fn next_u63(&mut self) -> u64 {
        self.rng.next_u64() & MASK_63
    }
}

/// Mixes `hash` against `stream` for [`KEYSTREAM_ROUNDS`] rounds.
///
/// Each round rotates the accumulator by the low six bits of a fresh draw
/// and XORs the draw in.
pub fn avalanche(hash: u64, stream: &mut Keystream) -> u64 {
    let mut h = hash;
    for _ in 0..KEYSTREAM_ROUNDS {
        let draw = stream.next_u63();
        h = h.rotate_left((draw & 63) as u32) ^ draw;
    }
    h
}

/// Damm check digit of `value` written in decimal.
pub fn damm_digit(value: u64) -> u8 {
    let mut digits = [0u8; 20];
    let mut len = 0;
    let mut rest = value;
    loop {
        digits[len] = (rest % 10) as u8;
        len += 1;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }

    digits[..len]
        .iter()
        .rev()
        .fold(0u8, |interim, &d| DAMM[interim as usize][d as usize])
}

/// Per-key probe parameters for one table instance.
///
/// `base` is the salted, avalanched hash and `step` the Damm-derived
/// perturbation, so [`ProbeSeq::slot`] is pure arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSeq {
    base: u64,
    step: u64,
}

impl ProbeSeq {
    /// Derives the probe parameters of a key from its hash, its string form
    /// and the table salt.
    pub fn new(hash: u64, key: &impl Display, salt: u64) -> Self {
        let mut stream = Keystream::from_display(key);
        let base = (avalanche(hash, &mut stream) ^ salt) & MASK_63;
        let step = (damm_digit(base) as u64).max(1);
        Self { base, step }
    }

    /// Slot visited on the `i`-th probe in a table of `capacity` slots.
    ///
    /// `capacity` must exceed the step (tables never drop below 16 slots).
    #[inline]
    pub fn slot(&self, i: u64, capacity: u64) -> u64 {
        debug_assert!(capacity > self.step);
        let m = capacity as u128;
        let h = self.base as u128;
        let i = i as u128;
        let spread = h % (m - self.step as u128);
        ((h + i * (i + spread)) % m) as u64
    }
}
