// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::time::Duration;

/// Constant backoff: yield for the first few retries, then sleep a fixed
/// interval between attempts.
///
/// Used wherever the registry has to spin for bin exclusivity. Constant
/// rather than exponential: the critical sections being waited out are a
/// handful of instructions, so the wait time does not grow.
pub(crate) struct ConstantBackoff {
    spins: u32,
}

impl ConstantBackoff {
    const MAX_SPINS: u32 = 16;
    #[cfg(not(loom))]
    const SLEEP: Duration = Duration::from_micros(50);

    pub(crate) const fn new() -> Self {
        Self { spins: 0 }
    }

    #[cfg(not(loom))]
    pub(crate) fn wait(&mut self) {
        if self.spins < Self::MAX_SPINS {
            self.spins += 1;
            crate::loom::thread::yield_now();
        } else {
            crate::loom::thread::sleep(Self::SLEEP);
        }
    }

    // loom has no notion of wall-clock sleeping; yielding is enough to let
    // the model explore the other thread.
    #[cfg(loom)]
    pub(crate) fn wait(&mut self) {
        self.spins += 1;
        crate::loom::thread::yield_now();
    }
}
