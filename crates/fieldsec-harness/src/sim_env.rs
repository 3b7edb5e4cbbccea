//! Simulated environment for deterministic tests.
//!
//! Time comes from tokio's clock, which turmoil and `start_paused` tests
//! control; randomness comes from a seeded `ChaCha8Rng`, so a given seed
//! reproduces every nonce, challenge and sender id.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use fieldsec_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Wall-clock value reported at the start of every simulation
const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Seeded, virtual-time environment.
///
/// Clones share the RNG stream.
#[derive(Debug, Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
    started: tokio::time::Instant,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            started: tokio::time::Instant::now(),
        }
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }

    fn wall_clock_millis(&self) -> u64 {
        SIM_EPOCH_MILLIS + self.started.elapsed().as_millis() as u64
    }
}
