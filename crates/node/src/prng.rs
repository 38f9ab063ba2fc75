//! Fast non-cryptographic randomness for jitter, packet IDs, and
//! conversation IDs. Never used for key material; secrets come from
//! `rand::rngs::OsRng` directly.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Thread-safe wrapper around a fast PRNG, seeded once from the OS at
/// construction.
pub struct Prng {
    inner: Mutex<SmallRng>,
}

impl Prng {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub fn next_u32(&self) -> u32 {
        self.inner.lock().unwrap().gen()
    }

    pub fn next_u64(&self) -> u64 {
        self.inner.lock().unwrap().gen()
    }

    /// Nonzero u64, for packet IDs.
    pub fn next_packet_id(&self) -> u64 {
        loop {
            let id = self.next_u64();
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for Prng {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_are_nonzero_and_vary() {
        let prng = Prng::new();
        let a = prng.next_packet_id();
        let b = prng.next_packet_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }
}
