// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The shared cancellation state block.
//!
//! One `AtomicU64` packs the whole lifecycle:
//!
//! ```text
//! bit 0        REQUESTED                 (cancellation has been requested)
//! bit 1        NOTIFY_COMPLETE           (every callback has been run)
//! bits 2..=32  source reference count    (initialized to 1)
//! bits 33..=63 token reference count
//! ```
//!
//! The two reference-count categories need independently nameable
//! increment/decrement operations, which is why this is hand-rolled instead
//! of using a generic shared-ownership primitive. The block frees itself
//! when *both* counts reach zero.

use crate::cancel::backoff::ConstantBackoff;
use crate::cancel::registry::Registry;
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use core::ptr::NonNull;
use static_assertions::const_assert_eq;

pub(crate) const REQUESTED: u64 = 1;
pub(crate) const NOTIFY_COMPLETE: u64 = 1 << 1;
const SOURCE_ONE: u64 = 1 << 2;
const TOKEN_ONE: u64 = 1 << 33;
/// Everything except the two flag bits: both reference counts.
const REFS_MASK: u64 = !(REQUESTED | NOTIFY_COMPLETE);
/// The state can still reach (or has reached) `REQUESTED`: a source
/// reference is live, or a request already happened.
const CANCELLABLE_MASK: u64 = TOKEN_ONE - 1;

const_assert_eq!(SOURCE_ONE & (REQUESTED | NOTIFY_COMPLETE), 0);
const_assert_eq!(CANCELLABLE_MASK & TOKEN_ONE, 0);

pub(crate) struct Shared {
    bits: AtomicU64,
    pub(crate) registry: Registry,
}

impl Shared {
    /// Allocates a fresh block holding one source reference.
    pub(crate) fn allocate() -> NonNull<Shared> {
        let block = Box::new(Shared {
            bits: AtomicU64::new(SOURCE_ONE),
            registry: Registry::new(),
        });
        // Safety: `Box::into_raw` never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(block)) }
    }

    pub(crate) fn add_source_ref(&self) {
        self.add_ref(SOURCE_ONE);
    }

    pub(crate) fn add_token_ref(&self) {
        self.add_ref(TOKEN_ONE);
    }

    fn add_ref(&self, unit: u64) {
        // Relaxed is sufficient: this RMW joins the release sequence between
        // the AcqRel decrements.
        self.bits.fetch_add(unit, Ordering::Relaxed);
    }

    /// Drops one source reference, freeing the block if it was the last
    /// reference of either kind.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and the caller must own exactly one source
    /// reference, which is consumed here.
    pub(crate) unsafe fn dec_source_ref(ptr: NonNull<Shared>) {
        // Safety: forwarded to the caller.
        unsafe { Self::dec_ref(ptr, SOURCE_ONE) }
    }

    /// Drops one token reference; see [`dec_source_ref`][Self::dec_source_ref].
    ///
    /// # Safety
    ///
    /// `ptr` must be live and the caller must own exactly one token
    /// reference, which is consumed here.
    pub(crate) unsafe fn dec_token_ref(ptr: NonNull<Shared>) {
        // Safety: forwarded to the caller.
        unsafe { Self::dec_ref(ptr, TOKEN_ONE) }
    }

    unsafe fn dec_ref(ptr: NonNull<Shared>, unit: u64) {
        // Safety: the caller's reference keeps the block live for this read.
        let old = unsafe { ptr.as_ref() }.bits.fetch_sub(unit, Ordering::AcqRel);

        // If the old count was exactly our unit, the last reference of
        // either kind is gone: the acquire above has made every other
        // handle's prior writes visible, and nobody can observe the block
        // anymore.
        if old & REFS_MASK == unit {
            tracing::trace!(block = ?ptr, "freeing cancellation state");
            // Safety: both reference counts are zero.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }

    pub(crate) fn is_cancellation_requested(&self) -> bool {
        self.bits.load(Ordering::Acquire) & REQUESTED != 0
    }

    /// `true` iff the state could still transition to requested (a source
    /// reference is live) or already has.
    pub(crate) fn can_be_cancelled(&self) -> bool {
        self.bits.load(Ordering::Acquire) & CANCELLABLE_MASK != 0
    }

    /// Flips `REQUESTED` (idempotently) and, as the first requester, drains
    /// the registry: every still-registered callback runs here, exactly
    /// once, outside any bin exclusivity. Returns `true` if cancellation had
    /// already been requested.
    ///
    /// The caller must hold a live reference for the duration (callbacks
    /// dropping their own registrations must not be able to free the block
    /// under us).
    pub(crate) fn request_cancellation(&self) -> bool {
        // Release publishes every write made before requesting cancellation
        // to observers of `REQUESTED`; Acquire pairs with the registering
        // side's publication of inserted nodes.
        let old = self.bits.fetch_or(REQUESTED, Ordering::AcqRel);
        if old & REQUESTED != 0 {
            return true;
        }

        tracing::trace!("cancellation requested; draining registered callbacks");
        let mut backoff = ConstantBackoff::new();
        loop {
            if let Some(node) = self.registry.pop_any() {
                // outside bin exclusivity: the callback may itself register,
                // deregister, or re-request without deadlocking
                node.invoke();
            } else if self.registry.is_empty() {
                break;
            } else {
                // an inhabited bin is momentarily claimed by a concurrent
                // (de)registration
                backoff.wait();
            }
        }

        self.bits.fetch_or(NOTIFY_COMPLETE, Ordering::Release);
        false
    }
}
