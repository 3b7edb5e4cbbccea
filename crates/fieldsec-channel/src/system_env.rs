//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` backs every channel opened with [`crate::open_secure_unicast`]
//! or [`crate::join_secure_multicast`]:
//!
//! - Real monotonic time (`std::time::Instant`) for handshake, idle and
//!   eviction timers
//! - OS cryptographic RNG (getrandom) for nonces, challenges, sender ids and
//!   keyring salts
//! - Wall-clock milliseconds to seed multicast sequence counters

use std::time::Duration;

use fieldsec_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. A secure channel without functioning
/// cryptographic randomness would reuse nonces and challenges, so there is
/// nothing safe to fall back to.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - nonces would repeat");
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_millis(&self) -> u64 {
        // A clock before 1970 seeds the counter at zero; the counter still
        // never repeats within this process.
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64)
    }
}
