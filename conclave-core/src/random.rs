//! Random number provider abstraction.
//!
//! The engine uses randomness in two places: picking a peer to read a
//! missing value from, and jittering wakeup delays. Both go through
//! [`RandomProvider`] so tests can pin the choices.

use std::cell::RefCell;
use std::ops::Range;

use rand::distr::uniform::SampleUniform;
use rand::prelude::*;

/// Provider trait for random number generation.
pub trait RandomProvider: Clone {
    /// Generate a random value within a range (exclusive upper bound).
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd;

    /// Generate a random f64 in `[0.0, 1.0)`.
    fn random_ratio(&self) -> f64;
}

/// Production random provider using the thread-local RNG.
#[derive(Clone, Default)]
pub struct TokioRandomProvider;

impl TokioRandomProvider {
    /// Create a new production random provider.
    pub fn new() -> Self {
        Self
    }
}

thread_local! {
    static RNG: RefCell<rand::rngs::ThreadRng> = RefCell::new(rand::rng());
}

impl RandomProvider for TokioRandomProvider {
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd,
    {
        RNG.with(|rng| rng.borrow_mut().random_range(range))
    }

    fn random_ratio(&self) -> f64 {
        RNG.with(|rng| rng.borrow_mut().random())
    }
}
