// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative cancellation: sources request it, tokens observe it,
//! registrations run a callback at-most-once when it happens.
//!
//! One [`CancellationSource`] and any number of [`CancellationToken`]s share
//! a reference-counted state block. Cancellation is strictly cooperative: no
//! computation is forcibly unwound; it must poll its token (or wrap itself
//! in [`CancellationToken::guard`]). The only guarantees are that
//! `requested` is monotonic — once observed `true` it stays `true` forever —
//! and that each registered callback runs at most once.

mod backoff;
mod node;
mod registry;
mod state;

use self::node::Node;
use self::state::Shared;
use crate::error::Cancelled;
use crate::loom::sync::Arc;
use core::fmt;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll};
use pin_project::pin_project;

/// Handle capable of requesting cancellation, exactly once.
///
/// Cloning yields another handle to the same underlying state (any clone may
/// request); the state lives until every source *and* every token referring
/// to it is gone.
pub struct CancellationSource {
    shared: NonNull<Shared>,
}

/// Handle capable of observing cancellation and registering callbacks.
///
/// Obtained from [`CancellationSource::token`]; cheap to clone.
pub struct CancellationToken {
    shared: NonNull<Shared>,
}

/// A pending cancellation callback, registered against a token.
///
/// Dropping the handle deregisters the callback. If cancellation was already
/// requested at registration time — or the registry refused the registration
/// under load — the callback has instead already run *synchronously, inline,
/// during registration*; callers must treat that as equivalent to the
/// deferred case, not as an error.
#[must_use = "dropping a `Registration` immediately deregisters its callback"]
pub struct Registration {
    node: Option<Arc<Node>>,
}

// === impl CancellationSource ===

impl CancellationSource {
    /// Creates a fresh cancellation state with this as its only source.
    pub fn new() -> Self {
        Self {
            shared: Shared::allocate(),
        }
    }

    fn shared(&self) -> &Shared {
        // Safety: this handle owns a source reference, keeping the block
        // alive.
        unsafe { self.shared.as_ref() }
    }

    /// `true` while cancellation can still be requested, or already has
    /// been.
    pub fn can_be_cancelled(&self) -> bool {
        self.shared().can_be_cancelled()
    }

    /// `true` once [`request_cancellation`][Self::request_cancellation] has
    /// been called on any handle to this state.
    pub fn is_cancellation_requested(&self) -> bool {
        self.shared().is_cancellation_requested()
    }

    /// Requests cancellation.
    ///
    /// Idempotent: the first caller flips the flag and runs every registered
    /// callback exactly once before returning; later callers observe `true`
    /// and do nothing. Once this returns, every token sees
    /// [`is_cancellation_requested`][CancellationToken::is_cancellation_requested]
    /// `== true`.
    ///
    /// Returns `true` if cancellation had already been requested.
    pub fn request_cancellation(&self) -> bool {
        self.shared().request_cancellation()
    }

    /// Mints a token observing this source.
    pub fn token(&self) -> CancellationToken {
        self.shared().add_token_ref();
        CancellationToken {
            shared: self.shared,
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CancellationSource {
    fn clone(&self) -> Self {
        self.shared().add_source_ref();
        Self {
            shared: self.shared,
        }
    }
}

impl Drop for CancellationSource {
    fn drop(&mut self) {
        // Safety: this handle owns exactly one source reference.
        unsafe { Shared::dec_source_ref(self.shared) }
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("requested", &self.is_cancellation_requested())
            .finish_non_exhaustive()
    }
}

// Safety: the shared block is only accessed through atomics and the bin
// claim protocol.
unsafe impl Send for CancellationSource {}
// Safety: see above.
unsafe impl Sync for CancellationSource {}

// === impl CancellationToken ===

impl CancellationToken {
    fn shared(&self) -> &Shared {
        // Safety: this handle owns a token reference, keeping the block
        // alive.
        unsafe { self.shared.as_ref() }
    }

    /// `true` once cancellation has been requested. Monotonic.
    pub fn is_cancellation_requested(&self) -> bool {
        self.shared().is_cancellation_requested()
    }

    /// `true` while the observed state can still become cancelled (a source
    /// is live), or already is.
    pub fn can_be_cancelled(&self) -> bool {
        self.shared().can_be_cancelled()
    }

    /// The cooperative polling point: returns `Err(`[`Cancelled`]`)` once
    /// cancellation has been requested.
    ///
    /// Computations unwind themselves with `?`; nothing is preempted for
    /// them.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancellation_requested() {
            Err(Cancelled(()))
        } else {
            Ok(())
        }
    }

    /// Registers `callback` to run once, at most once, when cancellation is
    /// requested.
    ///
    /// If cancellation was already requested, or the registry is saturated
    /// and refuses the registration (load shedding), the callback runs
    /// synchronously before this returns; the caller must tolerate inline
    /// execution.
    pub fn register<C>(&self, callback: C) -> Registration
    where
        C: FnOnce() + Send + 'static,
    {
        self.register_inner(Box::new(callback), false)
    }

    /// Like [`register`][Self::register], but never load-sheds: retries the
    /// registry (with backoff) until the callback is registered.
    ///
    /// A callback still runs inline if cancellation was (or becomes)
    /// requested during registration.
    pub fn register_forced<C>(&self, callback: C) -> Registration
    where
        C: FnOnce() + Send + 'static,
    {
        self.register_inner(Box::new(callback), true)
    }

    fn register_inner(&self, callback: Box<dyn FnOnce() + Send>, forced: bool) -> Registration {
        if self.is_cancellation_requested() {
            tracing::trace!("cancellation already requested; running callback inline");
            callback();
            return Registration { node: None };
        }

        let node = Arc::new(Node::new(callback, self.clone()));
        let registered = if forced {
            self.shared().registry.insert(&node);
            true
        } else {
            self.shared().registry.try_insert(&node)
        };

        if !registered {
            tracing::trace!("registry refused registration; running callback inline");
            node.invoke();
            return Registration { node: None };
        }

        // Close the race with a concurrent request: if cancellation was
        // requested after the check above, the drain may or may not have
        // seen our node. Pull it out and claim it ourselves — the claim CAS
        // keeps the callback at-most-once whichever side got there first.
        if self.is_cancellation_requested() {
            self.shared().registry.remove(&node);
            node.invoke();
            return Registration { node: None };
        }

        Registration { node: Some(node) }
    }

    /// Wraps `future` so that every poll first checks this token,
    /// short-circuiting with `Err(`[`Cancelled`]`)` once cancellation is
    /// requested.
    pub fn guard<F>(&self, future: F) -> Guarded<F>
    where
        F: Future,
    {
        Guarded {
            token: self.clone(),
            future,
        }
    }
}

impl Clone for CancellationToken {
    fn clone(&self) -> Self {
        self.shared().add_token_ref();
        Self {
            shared: self.shared,
        }
    }
}

impl Drop for CancellationToken {
    fn drop(&mut self) {
        // Safety: this handle owns exactly one token reference.
        unsafe { Shared::dec_token_ref(self.shared) }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("requested", &self.is_cancellation_requested())
            .finish_non_exhaustive()
    }
}

// Safety: the shared block is only accessed through atomics and the bin
// claim protocol.
unsafe impl Send for CancellationToken {}
// Safety: see above.
unsafe impl Sync for CancellationToken {}

// === impl Registration ===

impl Registration {
    /// `true` if the callback already ran synchronously during registration.
    pub fn ran_inline(&self) -> bool {
        self.node.is_none()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            // If a concurrent drain popped the node first, the removal finds
            // nothing and the callback may be running right now — the claim
            // flag already guarantees at-most-once, and the node's token
            // reference keeps the state alive until the last `Arc` is gone.
            node.token().shared().registry.remove(&node);
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("ran_inline", &self.ran_inline())
            .finish()
    }
}

// === impl Guarded ===

/// Future returned by [`CancellationToken::guard`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Guarded<F> {
    token: CancellationToken,
    #[pin]
    future: F,
}

impl<F: Future> Future for Guarded<F> {
    type Output = Result<F::Output, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Err(cancelled) = this.token.check() {
            return Poll::Ready(Err(cancelled));
        }
        this.future.poll(cx).map(Ok)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync_wait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn request_is_idempotent() {
        let source = CancellationSource::new();
        assert!(!source.is_cancellation_requested());

        assert!(!source.request_cancellation());
        assert!(source.is_cancellation_requested());

        // second call is a no-op and reports "already requested"
        assert!(source.request_cancellation());
    }

    #[test]
    fn tokens_observe_the_request() {
        let source = CancellationSource::new();
        let token = source.token();

        assert!(!token.is_cancellation_requested());
        assert!(token.check().is_ok());

        source.request_cancellation();

        // strictly after the source's call returns, with no race window
        assert!(token.is_cancellation_requested());
        assert!(token.check().is_err());
    }

    #[test]
    fn cancellability_tracks_source_liveness() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(source.can_be_cancelled());
        assert!(token.can_be_cancelled());

        // the last source is gone without a request: cancellation can never
        // happen anymore
        drop(source);
        assert!(!token.can_be_cancelled());

        let source = CancellationSource::new();
        let token = source.token();
        source.request_cancellation();
        drop(source);
        // the request already happened, so it stays observable
        assert!(token.can_be_cancelled());
        assert!(token.is_cancellation_requested());
    }

    #[test]
    fn callback_registered_before_request_runs_exactly_once_at_request() {
        let source = CancellationSource::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let registration = source.token().register({
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(!registration.ran_inline());
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        source.request_cancellation();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // a second request does not run it again
        source.request_cancellation();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        drop(registration);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_registered_after_request_runs_inline_exactly_once() {
        let source = CancellationSource::new();
        source.request_cancellation();

        let ran = Arc::new(AtomicUsize::new(0));
        let registration = source.token().register({
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(registration.ran_inline());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_registration_never_runs() {
        let source = CancellationSource::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let registration = source.token().register({
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(registration);

        source.request_cancellation();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn forced_registration_is_deferred_like_any_other() {
        let source = CancellationSource::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let registration = source.token().register_forced({
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(!registration.ran_inline());
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        source.request_cancellation();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn saturation_runs_callbacks_inline_but_never_drops_them() {
        let source = CancellationSource::new();
        let token = source.token();
        let ran = Arc::new(AtomicUsize::new(0));

        // well past the registry's 32 bins * 8 slots
        let total = 300;
        let registrations: Vec<_> = (0..total)
            .map(|_| {
                token.register({
                    let ran = Arc::clone(&ran);
                    move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        let inline = registrations.iter().filter(|r| r.ran_inline()).count();
        assert!(inline > 0, "saturation should have shed load inline");
        assert_eq!(ran.load(Ordering::SeqCst), inline);

        source.request_cancellation();
        // every callback ran exactly once, inline or deferred
        assert_eq!(ran.load(Ordering::SeqCst), total);

        drop(registrations);
        assert_eq!(ran.load(Ordering::SeqCst), total);
    }

    #[test]
    fn guard_passes_values_through_until_cancelled() {
        let source = CancellationSource::new();
        let token = source.token();

        let out = sync_wait(token.guard(core::future::ready(11)));
        assert_eq!(out.unwrap(), 11);

        source.request_cancellation();

        // the inner future must not be polled anymore; this one would panic
        struct Unpollable;
        impl Future for Unpollable {
            type Output = ();
            fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<()> {
                panic!("guarded future polled after cancellation");
            }
        }

        let out = sync_wait(token.guard(Unpollable));
        assert_eq!(out.unwrap_err(), crate::Cancelled(()));
    }

    #[test]
    fn registry_stress_multiset_property() {
        // Concurrently register and deregister from several threads, then
        // drain at cancellation: the multiset of callbacks that ran must be
        // exactly {kept registrations} ∪ {registrations shed inline}, each
        // exactly once, and deregistered callbacks must never run.
        const THREADS: usize = 4;
        const PER_THREAD: usize = 50;

        let source = CancellationSource::new();
        let counters: Vec<Vec<_>> = (0..THREADS)
            .map(|_| {
                (0..PER_THREAD)
                    .map(|_| Arc::new(AtomicUsize::new(0)))
                    .collect()
            })
            .collect();

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let token = source.token();
                let counters = counters[t].clone();
                thread::spawn(move || {
                    let mut kept = Vec::new();
                    let mut ran_inline = Vec::new();
                    for (i, counter) in counters.into_iter().enumerate() {
                        let registration = token.register({
                            let counter = Arc::clone(&counter);
                            move || {
                                counter.fetch_add(1, Ordering::SeqCst);
                            }
                        });
                        ran_inline.push(registration.ran_inline());
                        if i % 2 == 0 {
                            kept.push(registration);
                        }
                        // odd registrations are dropped (deregistered) here
                    }
                    (kept, ran_inline)
                })
            })
            .collect();

        let mut kept = Vec::new();
        let mut ran_inline = Vec::new();
        for handle in handles {
            let (k, inline) = handle.join().unwrap();
            kept.push(k);
            ran_inline.push(inline);
        }

        source.request_cancellation();

        for (t, thread_counters) in counters.iter().enumerate() {
            for (i, counter) in thread_counters.iter().enumerate() {
                let runs = counter.load(Ordering::SeqCst);
                let expected = if i % 2 == 0 || ran_inline[t][i] { 1 } else { 0 };
                assert_eq!(
                    runs, expected,
                    "registration {t}/{i} (kept: {}, inline: {})",
                    i % 2 == 0,
                    ran_inline[t][i],
                );
            }
        }

        drop(kept);
    }

    #[test]
    fn concurrent_requests_drain_exactly_once() {
        let source = CancellationSource::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let _registrations: Vec<_> = (0..64)
            .map(|_| {
                source.token().register({
                    let ran = Arc::clone(&ran);
                    move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        let racers: Vec<_> = (0..4)
            .map(|_| {
                let source = source.clone();
                thread::spawn(move || source.request_cancellation())
            })
            .collect();
        let already: Vec<bool> = racers.into_iter().map(|h| h.join().unwrap()).collect();

        // exactly one racer was first
        assert_eq!(already.iter().filter(|&&a| !a).count(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 64);
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::sync::atomic::{AtomicUsize, Ordering};
    use loom::thread;

    #[test]
    fn deregistration_races_drain_at_most_once() {
        loom::model(|| {
            let source = CancellationSource::new();
            let ran = Arc::new(AtomicUsize::new(0));

            let registration = source.token().register({
                let ran = Arc::clone(&ran);
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            });

            let requester = {
                let source = source.clone();
                thread::spawn(move || {
                    source.request_cancellation();
                })
            };

            drop(registration);
            requester.join().unwrap();

            assert!(ran.load(Ordering::SeqCst) <= 1);
        });
    }

    #[test]
    fn refcounts_free_exactly_once() {
        loom::model(|| {
            let source = CancellationSource::new();
            let token = source.token();

            let t1 = thread::spawn(move || drop(token));
            let t2 = thread::spawn(move || drop(source));

            t1.join().unwrap();
            t2.join().unwrap();
            // loom's leak checker verifies the block was freed exactly once
        });
    }

    #[test]
    fn concurrent_inserts_land_in_disjoint_bins() {
        loom::model(|| {
            let source = CancellationSource::new();
            let ran = Arc::new(AtomicUsize::new(0));

            let reg_a = {
                let token = source.token();
                let ran = Arc::clone(&ran);
                thread::spawn(move || {
                    token.register(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    })
                })
            };

            let reg_b = source.token().register({
                let ran = Arc::clone(&ran);
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            });

            let reg_a = reg_a.join().unwrap();

            source.request_cancellation();
            assert_eq!(ran.load(Ordering::SeqCst), 2);

            drop((reg_a, reg_b));
        });
    }
}
