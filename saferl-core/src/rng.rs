// Process wide randomness. Minibatch shuffling and env reset seeds are drawn from here, so
// seeding it once at the start of a run makes the whole run reproducible.

use rand::{Rng, SeedableRng, rngs::StdRng};
use std::cell::RefCell;

thread_local! {
    pub static RNG: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(0));
}

pub fn seed_rng(seed: u64) {
    RNG.with_borrow_mut(|rng| *rng = StdRng::seed_from_u64(seed));
}

pub fn random_seed() -> u64 {
    RNG.with_borrow_mut(|rng| rng.random::<u64>())
}
