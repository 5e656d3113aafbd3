//! Seeded Bernoulli sampling.

use p2g4_common::{Probability, PROB_ONE};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Default simulation seed.
pub const DEFAULT_SEED: u64 = 0xFFFF;

/// Deterministic Bernoulli sampler used for bit errors and sync decisions.
#[derive(Debug, Clone)]
pub struct BitErrorRng {
    rng: ChaCha8Rng,
}

impl BitErrorRng {
    /// Create a sampler from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Draw one sample that is true with probability `p / PROB_ONE`.
    ///
    /// The extremes never consume randomness.
    pub fn bern(&mut self, p: Probability) -> bool {
        match p {
            0 => false,
            PROB_ONE => true,
            _ => self.rng.gen::<u32>() < p,
        }
    }

    /// Number of successes among `n` draws.
    pub fn bern_count(&mut self, p: Probability, n: u32) -> u32 {
        (0..n).filter(|_| self.bern(p)).count() as u32
    }
}

impl Default for BitErrorRng {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}
