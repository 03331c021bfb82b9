// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Randomized exponential spin backoff.

use std::cell::RefCell;
use std::hint;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

thread_local!(static SEED: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy()));

/// Upper bound of the spin mask. Doubling stops here.
const MAX_MASK: u32 = 0xff;

/// `Backoff` spins for a random number of pause instructions, the range
/// doubling on every call until it saturates.
///
/// A fresh `Backoff` is created for every contended section.
#[derive(Debug, Default)]
pub struct Backoff {
    mask: u32,
}

impl Backoff {
    pub fn new() -> Backoff {
        Backoff { mask: 0 }
    }

    /// Spin once and widen the window for the next call.
    pub fn spin(&mut self) {
        self.mask = (2 * self.mask + 1).min(MAX_MASK);
        let n = 1 + (SEED.with(|rng| rng.borrow_mut().gen::<u32>()) & self.mask);
        for _ in 0..n {
            hint::spin_loop();
        }
    }

    /// Start over with the smallest window.
    pub fn reset(&mut self) {
        self.mask = 0;
    }
}
