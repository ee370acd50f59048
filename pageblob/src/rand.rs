//! Random number generation for conflict backoff jitter.
//!
//! Writers that collide on the same revision tag must not wake up in lock step, or they
//! collide again. Every store owns one seeded [BlobRand] and hands it to the retry
//! executor. Each thread lazily gets its own Xoroshiro128++ generator, seeded from a shared
//! counter. `seed_from_u64` runs the counter through SplitMix64, so consecutive seeds still
//! give uncorrelated streams.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;
use rand::SeedableRng;
use rand_xoshiro::Xoroshiro128PlusPlus;
use thread_local::ThreadLocal;

type RngAlg = Xoroshiro128PlusPlus;

/// A shareable, lock-free random number generator.
///
/// With a fixed seed and a single thread the sequence is deterministic, which the tests
/// rely on. With more threads the sequence depends on scheduling.
#[derive(Debug)]
pub struct BlobRand {
    seed_counter: AtomicU64,
    thread_rng: ThreadLocal<RefCell<RngAlg>>,
}

impl BlobRand {
    /// Create a new `BlobRand` with the given 64-bit seed.
    pub fn new(seed: u64) -> Self {
        BlobRand {
            seed_counter: AtomicU64::new(seed),
            thread_rng: ThreadLocal::new(),
        }
    }

    /// Grab this thread's RNG. Initializes the RNG if it hasn't been initialized yet.
    pub fn thread_rng(&self) -> std::cell::RefMut<'_, impl RngCore> {
        self.thread_rng
            .get_or(|| {
                let seed = self.seed_counter.fetch_add(1, Ordering::Relaxed);
                RefCell::new(RngAlg::seed_from_u64(seed))
            })
            .borrow_mut()
    }
}

impl Default for BlobRand {
    fn default() -> Self {
        Self::new(rand::random())
    }
}
