// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The lock-free sharded registry of pending cancellation callbacks.
//!
//! Storage is 32 independently claimable bins. The only synchronized state
//! is one 64-bit word: the low 32 bits flag bins that are *available* (not
//! currently being mutated by another thread), the high 32 bits flag bins
//! that are *inhabited* (non-empty). A bin's contents may only be touched
//! while its availability bit has been claimed through a compare-and-swap,
//! which gives 32-way concurrent mutation of disjoint bins with no shared
//! lock anywhere.
//!
//! The inhabited bits are an emptiness hint for the drain's fast path; they
//! are brought back in sync with actual occupancy at the moment exclusivity
//! is released, never while it is held by someone else.

use super::node::Node;
use crate::cancel::backoff::ConstantBackoff;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use arrayvec::ArrayVec;
use static_assertions::const_assert;

/// Number of bins; 32 lets availability and inhabited bits share one word.
pub(crate) const BIN_COUNT: usize = 32;

/// Occupancy limit per bin. Beyond this, insertion is refused (load
/// shedding) rather than grown: fixed capacity means no bin operation can
/// ever allocate while holding exclusivity.
pub(crate) const MAX_BIN_LEN: usize = 8;

const AVAILABLE_MASK: u64 = (1 << BIN_COUNT) - 1;

const_assert!(BIN_COUNT * 2 <= u64::BITS as usize);

type Bin = ArrayVec<Arc<Node>, MAX_BIN_LEN>;

fn available_bit(idx: usize) -> u64 {
    1 << idx
}

fn inhabited_bit(idx: usize) -> u64 {
    1 << (BIN_COUNT + idx)
}

fn is_available(flags: u64, idx: usize) -> bool {
    flags & available_bit(idx) != 0
}

/// Bins that are both inhabited and available, as a 32-bit view.
fn inhabited_and_available(flags: u64) -> u64 {
    flags & AVAILABLE_MASK & (flags >> BIN_COUNT)
}

/// Probes linearly from `start` for an available bin.
fn probe_available(flags: u64, start: usize) -> Option<usize> {
    (0..BIN_COUNT)
        .map(|offset| (start + offset) % BIN_COUNT)
        .find(|&idx| is_available(flags, idx))
}

/// Starting bin, randomized by thread to spread contention.
#[cfg(not(loom))]
fn start_bin() -> usize {
    fastrand::usize(..BIN_COUNT)
}

// loom executions must be deterministic across iterations
#[cfg(loom)]
fn start_bin() -> usize {
    0
}

pub(crate) struct Registry {
    bins: [UnsafeCell<Bin>; BIN_COUNT],
    flags: AtomicU64,
}

// Safety: a bin is only touched while the corresponding availability bit is
// held exclusively (claimed via CAS on `flags`).
unsafe impl Send for Registry {}
// Safety: see above.
unsafe impl Sync for Registry {}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            bins: core::array::from_fn(|_| UnsafeCell::new(ArrayVec::new())),
            // all bins available, none inhabited
            flags: AtomicU64::new(AVAILABLE_MASK),
        }
    }

    /// `true` if no bin is inhabited.
    pub(crate) fn is_empty(&self) -> bool {
        self.flags.load(Ordering::Acquire) >> BIN_COUNT == 0
    }

    /// Tries to insert `node`, starting at a thread-randomized bin to spread
    /// contention. Returns `false` (load shedding) when every bin is claimed
    /// or at capacity.
    pub(crate) fn try_insert(&self, node: &Arc<Node>) -> bool {
        self.try_insert_from(node, start_bin())
    }

    /// Inserts `node`, retrying indefinitely with an incrementing starting
    /// bin. Backs off after each full sweep so sustained contention does not
    /// live-spin.
    pub(crate) fn insert(&self, node: &Arc<Node>) {
        let mut idx = start_bin();
        let mut backoff = ConstantBackoff::new();
        let mut attempts: usize = 0;
        while !self.try_insert_from(node, idx) {
            idx = (idx + 1) % BIN_COUNT;
            attempts += 1;
            if attempts % BIN_COUNT == 0 {
                backoff.wait();
            }
        }
    }

    pub(crate) fn try_insert_from(&self, node: &Arc<Node>, start: usize) -> bool {
        // claim some available bin at or after `start`
        let mut flags = self.flags.load(Ordering::Acquire);
        let idx = loop {
            let idx = probe_available(flags, start);
            let next = match idx {
                Some(idx) => flags ^ available_bit(idx),
                // nothing claimable right now; leave the word unchanged
                None => flags,
            };
            match self
                .flags
                .compare_exchange_weak(flags, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break idx,
                Err(actual) => flags = actual,
            }
        };
        let Some(idx) = idx else {
            tracing::trace!("registry refused insertion: no available bin");
            return false;
        };

        // this thread now has exclusive access to bins[idx]
        let mut release = available_bit(idx);
        let inserted = self.bins[idx].with_mut(|bin| {
            // Safety: the availability bit was claimed above.
            let bin = unsafe { &mut *bin };
            if bin.is_full() {
                false
            } else {
                bin.push(Arc::clone(node));
                node.record_bin(idx);
                true
            }
        });
        if inserted {
            release |= inhabited_bit(idx);
        } else {
            tracing::trace!(bin = idx, "registry refused insertion: bin at capacity");
        }

        // Re-set the availability bit (and the inhabited bit on success),
        // publishing the bin contents. AcqRel rather than Release: if a
        // drain's flag traffic precedes this RMW, everything that preceded
        // the drain — in particular the `requested` flip — becomes visible,
        // so the registering side's post-insert re-check cannot miss a
        // request whose drain missed this node.
        self.flags.fetch_or(release, Ordering::AcqRel);
        inserted
    }

    /// Removes `node` from the bin it was recorded in, spinning (with
    /// backoff) until that bin can be claimed.
    pub(crate) fn remove(&self, node: &Arc<Node>) {
        let idx = node.recorded_bin();
        let claim = available_bit(idx);
        let mut backoff = ConstantBackoff::new();

        loop {
            let flags = self.flags.load(Ordering::Acquire);
            if is_available(flags, idx)
                && self
                    .flags
                    .compare_exchange_weak(flags, flags ^ claim, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                break;
            }
            backoff.wait();
        }

        // this thread now has exclusive access to bins[idx]
        let mut release = claim;
        self.bins[idx].with_mut(|bin| {
            // Safety: the availability bit was claimed above.
            let bin = unsafe { &mut *bin };
            // The node may already be gone: a concurrent drain pops nodes
            // before invoking them.
            if !bin.is_empty() {
                bin.retain(|candidate| !Arc::ptr_eq(candidate, node));
                if bin.is_empty() {
                    release |= inhabited_bit(idx);
                }
            }
        });

        // Toggle availability back on, and the inhabited bit off if the bin
        // ended up empty.
        self.flags.fetch_xor(release, Ordering::Release);
    }

    /// Claims some inhabited bin and pops one node from it. Returns `None`
    /// when no bin is currently both inhabited and available — which does
    /// *not* mean the registry is empty; see [`is_empty`][Self::is_empty].
    pub(crate) fn pop_any(&self) -> Option<Arc<Node>> {
        let mut flags = self.flags.load(Ordering::Acquire);
        let idx = loop {
            let ready = inhabited_and_available(flags);
            let idx = (ready != 0).then(|| ready.trailing_zeros() as usize);
            let next = match idx {
                Some(idx) => flags ^ available_bit(idx),
                None => flags,
            };
            match self
                .flags
                .compare_exchange_weak(flags, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break idx,
                Err(actual) => flags = actual,
            }
        };
        let idx = idx?;

        // this thread now has exclusive access to bins[idx]
        let mut release = available_bit(idx);
        let node = self.bins[idx].with_mut(|bin| {
            // Safety: the availability bit was claimed above.
            let bin = unsafe { &mut *bin };
            let node = bin.pop();
            if bin.is_empty() {
                release |= inhabited_bit(idx);
            }
            node
        });
        debug_assert!(node.is_some(), "inhabited bin was empty");

        self.flags.fetch_xor(release, Ordering::Release);
        node
    }
}
