// rng.rs — Deterministic variant randomness
//
// `rng(seed)` is the only randomness the engine consumes. Each draw hashes
// `seed || counter` with SHA-256 and keeps the top 53 bits, so a given seed
// always yields the same stream on every platform.

use sha2::{Digest, Sha256};

/// A reproducible stream of floats in `[0, 1)`.
#[derive(Debug, Clone)]
pub struct VariantRng {
    seed: String,
    counter: u64,
}

impl VariantRng {
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            counter: 0,
        }
    }

    pub fn next_f64(&mut self) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.as_bytes());
        hasher.update(self.counter.to_le_bytes());
        self.counter += 1;
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        let bits = u64::from_be_bytes(word) >> 11;
        bits as f64 / (1u64 << 53) as f64
    }

    /// Uniform integer in `0..bound` (`bound > 0`).
    pub fn below(&mut self, bound: usize) -> usize {
        let i = (self.next_f64() * bound as f64) as usize;
        i.min(bound.saturating_sub(1))
    }
}

/// Fisher–Yates permutation of `0..n` driven by `seed`.
pub fn permutation(seed: &str, n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = VariantRng::new(seed);
    for i in (1..n).rev() {
        let j = rng.below(i + 1);
        order.swap(i, j);
    }
    order
}
