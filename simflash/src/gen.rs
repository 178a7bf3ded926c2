//! Random payload generation for stress tests.
//!
//! Stress tests want a reproducible stream of different-sized payloads
//! rather than a single fixed buffer; a seeded PRNG gives repeatable
//! failures without needing to check in megabytes of test fixtures.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

/// A reproducible source of payload bytes.
pub struct PayloadGenerator {
    rng: Xoshiro256Plus,
}

impl PayloadGenerator {
    pub fn seeded(seed: u64) -> Self {
        PayloadGenerator {
            rng: Xoshiro256Plus::seed_from_u64(seed),
        }
    }

    pub fn next_payload(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.rng.fill_bytes(&mut buf);
        buf
    }

    /// A length in `[0, max_len]`, for tests that want to vary payload
    /// size as well as content.
    pub fn next_len(&mut self, max_len: usize) -> usize {
        if max_len == 0 {
            return 0;
        }
        (self.rng.next_u32() as usize) % (max_len + 1)
    }
}

/// Builds a catalog device, reporting layout mistakes (mismatched
/// write/erase granularity) as an ergonomic `anyhow` error rather than
/// `flash_api::Error`, since this helper is only ever used from host-side
/// test setup.
pub fn build_or_report(layout: &crate::styles::DeviceLayout) -> anyhow::Result<crate::SimFlash> {
    layout
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build simulated flash: {:?}", e))
}
