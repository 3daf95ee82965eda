//! Thread-local deterministic random number generation.
//!
//! Every draw of randomness in the simulation (latency sampling, payload
//! jitter) goes through a thread-local generator seeded once per run. The
//! same seed therefore reproduces the same sequence of draws, which is what
//! makes simulation runs replayable.

use rand::distr::uniform::SampleUniform;
use rand::distr::{Distribution, StandardUniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::{Cell, RefCell};
use std::ops::Range;

thread_local! {
    static SIM_RNG: RefCell<Option<StdRng>> = const { RefCell::new(None) };
    static SIM_SEED: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Seeds the thread-local generator for the current simulation run.
///
/// Call before a run starts; [`crate::SimWorld`] constructors do this for
/// you. Re-seeding mid-run restarts the sequence.
pub fn set_sim_seed(seed: u64) {
    SIM_SEED.with(|s| s.set(Some(seed)));
    SIM_RNG.with(|rng| {
        *rng.borrow_mut() = Some(StdRng::seed_from_u64(seed));
    });
}

/// Clears the thread-local generator state.
///
/// Makes consecutive simulations on the same thread independent: the next
/// draw after a reset behaves as if seeded with the default seed (0) unless
/// [`set_sim_seed`] is called first.
pub fn reset_sim_rng() {
    SIM_SEED.with(|s| s.set(None));
    SIM_RNG.with(|rng| {
        *rng.borrow_mut() = None;
    });
}

/// Returns the seed of the current run, if one has been set.
pub fn get_current_sim_seed() -> Option<u64> {
    SIM_SEED.with(|s| s.get())
}

fn with_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    SIM_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        let rng = rng.get_or_insert_with(|| {
            SIM_SEED.with(|s| s.set(Some(0)));
            StdRng::seed_from_u64(0)
        });
        f(rng)
    })
}

/// Generates a random value of type `T` from the seeded generator.
pub fn sim_random<T>() -> T
where
    StandardUniform: Distribution<T>,
{
    with_rng(|rng| rng.random())
}

/// Generates a random value within `range` from the seeded generator.
///
/// # Panics
///
/// Panics if the range is empty; use [`sim_random_range_or_default`] when
/// a degenerate range is a legal input.
pub fn sim_random_range<T>(range: Range<T>) -> T
where
    T: SampleUniform + PartialOrd,
{
    with_rng(|rng| rng.random_range(range))
}

/// Generates a random value within `range`, collapsing an empty range to its
/// lower bound.
///
/// Latency configurations use fixed values by expressing them as
/// `x..x` ranges; sampling such a range yields `x`.
pub fn sim_random_range_or_default<T>(range: Range<T>) -> T
where
    T: SampleUniform + PartialOrd + Copy,
{
    if range.start >= range.end {
        range.start
    } else {
        sim_random_range(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        set_sim_seed(42);
        let first: Vec<u64> = (0..8).map(|_| sim_random_range(0..1000u64)).collect();

        set_sim_seed(42);
        let second: Vec<u64> = (0..8).map(|_| sim_random_range(0..1000u64)).collect();

        assert_eq!(first, second);
        reset_sim_rng();
    }

    #[test]
    fn different_seeds_diverge() {
        set_sim_seed(1);
        let first: Vec<u64> = (0..16).map(|_| sim_random_range(0..u64::MAX)).collect();

        set_sim_seed(2);
        let second: Vec<u64> = (0..16).map(|_| sim_random_range(0..u64::MAX)).collect();

        assert_ne!(first, second);
        reset_sim_rng();
    }

    #[test]
    fn degenerate_range_collapses_to_start() {
        set_sim_seed(7);
        assert_eq!(sim_random_range_or_default(5..5u64), 5);
        assert_eq!(sim_random_range_or_default(0..0u64), 0);
        reset_sim_rng();
    }
}
