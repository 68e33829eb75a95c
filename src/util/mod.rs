//! Shared utility traits and data structures.

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::{Rng, SeedableRng};

mod lru;
mod sched;

pub use self::lru::LruCache;
pub use self::sched::{Timekeeper, Timer, TimerId};

/// A monotonic clock.
///
/// The core never reads wall-clock time; every timeout and round-trip
/// measurement is derived from this trait, so tests can substitute a
/// manually advanced clock.
pub trait Clock {
	/// Monotonic time in nanoseconds since an arbitrary epoch.
	fn now(&self) -> u64;
}

/// Nanoseconds elapsed between `since` and the current clock value.
#[inline]
pub fn elapsed(clock: &dyn Clock, since: u64) -> u64 {
	clock.now().wrapping_sub(since)
}

/// A pseudo-random number source.
///
/// One method is all the core needs (seeding the IPv4 identification
/// counter); deployments provide entropy however their platform can.
pub trait Prng {
	fn next_u32(&mut self) -> u32;
}

/// Default [`Prng`] backed by a ChaCha20 stream cipher.
pub struct ChaChaPrng(ChaCha20Rng);

impl ChaChaPrng {
	pub fn from_seed(seed: [u8; 32]) -> Self {
		Self(ChaCha20Rng::from_seed(seed))
	}
}

impl Prng for ChaChaPrng {
	fn next_u32(&mut self) -> u32 {
		self.0.next_u32()
	}
}
