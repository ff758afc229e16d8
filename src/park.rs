// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-blocking seam used by the [synchronous bridge][crate::sync_wait].

use core::time::Duration;

/// A pluggable thread-blocking primitive.
///
/// The [synchronous bridge][crate::sync_wait] blocks through this trait
/// rather than on `std` directly, so alternative parkers (instrumented,
/// simulated, or platform-specific) can be injected in tests.
pub trait Park: Send + Sync {
    /// Blocks the current thread until [`unpark`][Self::unpark] is called.
    ///
    /// May wake spuriously; callers must re-check their condition.
    fn park(&self);

    /// Blocks the current thread until [`unpark`][Self::unpark] is called or
    /// `timeout` elapses, whichever comes first.
    fn park_timeout(&self, timeout: Duration);

    /// Wakes the parked thread.
    fn unpark(&self);
}

/// [`Park`] implementation backed by the standard library's thread parker.
#[derive(Debug)]
pub struct StdPark(crate::loom::thread::Thread);

impl StdPark {
    /// Returns a parker for the calling thread.
    pub fn for_current() -> Self {
        Self(crate::loom::thread::current())
    }
}

impl Park for StdPark {
    fn park(&self) {
        tracing::trace!("parking current thread ({:?})...", self.0);
        crate::loom::thread::park();
    }

    #[cfg(not(loom))]
    fn park_timeout(&self, timeout: Duration) {
        crate::loom::thread::park_timeout(timeout);
    }

    #[cfg(loom)]
    fn park_timeout(&self, _timeout: Duration) {
        unreachable!("loom doesn't support `park_timeout`");
    }

    fn unpark(&self) {
        tracing::trace!("unparking thread {:?}...", self.0);
        self.0.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::atomic::{AtomicBool, Ordering};
    use crate::loom::thread;

    #[test]
    fn parking_basically_works() {
        // Thread A parks itself after handing an unpark handle to thread B
        // through a channel; thread B unparks it.
        crate::loom::model(|| {
            crate::loom::lazy_static! {
                static ref A_UNPARKED: AtomicBool = AtomicBool::new(false);
            }
            let (tx, rx) = crate::loom::sync::mpsc::channel();

            let a = thread::spawn(move || {
                let parker = std::sync::Arc::new(StdPark::for_current());

                // send over the unpark handle
                tx.send(parker.clone()).unwrap();

                // and finally park ourselves, tolerating spurious wakeups
                while !A_UNPARKED.load(Ordering::Acquire) {
                    parker.park();
                }
            });

            let b = thread::spawn(move || {
                let unpark = rx.recv().unwrap();

                A_UNPARKED.store(true, Ordering::Release);
                unpark.unpark();
            });

            let _ = a.join();
            let _ = b.join();

            assert!(A_UNPARKED.load(Ordering::Acquire));
        });
    }
}
