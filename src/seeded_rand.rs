//! Randomness for the scheduler: reproducible when a seed is configured.

use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;

/// The RNG used for refresh times, mirror choice and partitioning.
pub type SchedulerRng = ChaCha12Rng;

/// Build the scheduler RNG from an optional seed.
pub fn rng_from_seed(seed: Option<u64>) -> SchedulerRng {
    match seed {
        Some(seed) => ChaCha12Rng::seed_from_u64(seed),
        None => ChaCha12Rng::from_entropy(),
    }
}
