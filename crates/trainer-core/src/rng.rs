//! Explicit, checkpointable randomness
//!
//! The engine never relies on process-ambient randomness: all draws go
//! through a [`TrainingRng`] owned by the State container, and its position
//! is captured as a (seed, draw-count) pair so a restored run replays the
//! exact same stream.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Serializable RNG position: the seed plus the number of draws taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RngState {
    /// Seed the stream was created from
    pub seed: u64,

    /// Number of draws taken since seeding
    pub draws: u64,
}

/// Deterministic RNG threaded through training state.
#[derive(Debug, Clone)]
pub struct TrainingRng {
    rng: ChaCha8Rng,
    seed: u64,
    draws: u64,
}

impl TrainingRng {
    /// Create a fresh stream from a seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
            draws: 0,
        }
    }

    /// Restore a stream to a checkpointed position by replaying draws.
    pub fn restore(state: RngState) -> Self {
        let mut rng = Self::from_seed(state.seed);
        for _ in 0..state.draws {
            let _ = rng.rng.gen::<u64>();
        }
        rng.draws = state.draws;
        rng
    }

    /// Draw the next u64 from the stream.
    pub fn next_u64(&mut self) -> u64 {
        self.draws += 1;
        self.rng.gen()
    }

    /// Draw the next f64 in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        self.draws += 1;
        self.rng.gen()
    }

    /// Current serializable position.
    pub fn state(&self) -> RngState {
        RngState {
            seed: self.seed,
            draws: self.draws,
        }
    }

    /// Seed this stream was created from.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}
