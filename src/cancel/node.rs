// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cancel::CancellationToken;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::fmt;

/// One pending callback registration.
///
/// The node is shared between the bin it lives in, the [`Registration`]
/// handle owning it, and (transiently) a drain that popped it. Whoever wins
/// the claim flag runs the callback; everyone else observes it as already
/// spoken for. That single CAS is what makes the callback at-most-once under
/// every interleaving of drain, deregistration, and late registration.
///
/// [`Registration`]: crate::cancel::Registration
pub(crate) struct Node {
    /// Taken exactly once, by the claim winner.
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    claimed: AtomicBool,
    /// Index of the bin this node was inserted into.
    bin: AtomicUsize,
    /// Keeps the shared cancellation state alive for as long as the callback
    /// may still run.
    token: CancellationToken,
}

// Safety: the callback cell is only accessed by the thread that wins the
// claim CAS.
unsafe impl Send for Node {}
// Safety: see above.
unsafe impl Sync for Node {}

impl Node {
    pub(crate) fn new(callback: Box<dyn FnOnce() + Send>, token: CancellationToken) -> Self {
        Self {
            callback: UnsafeCell::new(Some(callback)),
            claimed: AtomicBool::new(false),
            bin: AtomicUsize::new(usize::MAX),
            token,
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn record_bin(&self, idx: usize) {
        self.bin.store(idx, Ordering::Relaxed);
    }

    pub(crate) fn recorded_bin(&self) -> usize {
        let idx = self.bin.load(Ordering::Relaxed);
        debug_assert_ne!(idx, usize::MAX, "node was never inserted into a bin");
        idx
    }

    /// Runs the callback if this caller is the first to claim it.
    pub(crate) fn invoke(&self) {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let callback = self.callback.with_mut(|callback| {
                // Safety: winning the claim grants exclusive access to the
                // callback cell.
                unsafe { (*callback).take() }
            });
            if let Some(callback) = callback {
                tracing::trace!("running cancellation callback");
                callback();
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("claimed", &self.claimed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
