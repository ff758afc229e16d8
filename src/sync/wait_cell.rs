// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::util::{CachePadded, loom_const_fn};
use bitflags::bitflags;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use static_assertions::const_assert_eq;

/// An atomically registered [`Waker`].
///
/// This cell stores the [`Waker`] of a single task — the "continuation" every
/// primitive in this crate resumes on completion. A waker is stored by
/// calling [`poll_wait`], and the stored waker is woken by calling [`wake`].
/// If [`wake`] is called while no waker is registered, the wakeup is stored
/// and the next [`poll_wait`] consumes it immediately.
///
/// The synchronization strategy follows Tokio's `AtomicWaker`: a small
/// bitflags word arbitrates between the registering task and the waking
/// thread, so neither ever blocks.
///
/// Everything here is strictly single-consumer, single-completion: two tasks
/// concurrently registering is a contract violation and fails loudly instead
/// of silently dropping one of them.
///
/// [`poll_wait`]: Self::poll_wait
/// [`wake`]: Self::wake
pub struct WaitCell {
    state: CachePadded<AtomicUsize>,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct State: usize {
        const WAITING = 0b000;
        const REGISTERING = 0b001;
        const WAKING = 0b010;
        const WOKEN = 0b100;
    }
}
// WAITING must be zero
const_assert_eq!(State::WAITING.bits(), 0);

/// Future returned from [`WaitCell::wait()`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    /// The [`WaitCell`] being waited on.
    cell: &'a WaitCell,
}

// === impl WaitCell ===

impl WaitCell {
    loom_const_fn! {
        pub const fn new() -> Self {
            Self {
                state: CachePadded(AtomicUsize::new(State::WAITING.bits())),
                waker: UnsafeCell::new(None),
            }
        }
    }

    /// Poll to wait on this cell, registering the [`Waker`] from `cx` if no
    /// wakeup has happened yet.
    ///
    /// Returns [`Poll::Ready`] if the cell has been woken since the waker was
    /// registered (or holds a stored wakeup), [`Poll::Pending`] once the
    /// waker is registered.
    ///
    /// # Panics
    ///
    /// Panics if another task is concurrently registering: this cell holds
    /// the *single* continuation of a single-completion event.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<()> {
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::WOKEN) => {
                // consume the stored wakeup
                self.fetch_and(!State::WOKEN, Ordering::Release);
                return Poll::Ready(());
            }
            // someone is mid-wake; the wakeup is ours
            Err(actual) if actual.contains(State::WAKING) => return Poll::Ready(()),
            Err(actual) => {
                debug_assert!(actual.contains(State::REGISTERING));
                panic!("two tasks concurrently awaited the same `WaitCell`");
            }
            Ok(_) => {}
        }

        let waker = cx.waker();
        tracing::trace!(wait_cell = ?self, "registering waker");

        let prev_waker = self.waker.with_mut(|old_waker| {
            // Safety: the REGISTERING bit grants this thread exclusive access
            // to the waker slot.
            unsafe {
                match &mut *old_waker {
                    Some(old_waker) if waker.will_wake(old_waker) => None,
                    old => old.replace(waker.clone()),
                }
            }
        });

        if let Some(prev_waker) = prev_waker {
            tracing::trace!("replaced an old waker in cell, waking");
            prev_waker.wake();
        }

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // A wakeup arrived while we were registering. Reset the cell,
            // reclaim the waker we just stored, and report the wakeup.
            debug_assert!(actual.contains(State::WOKEN));
            tracing::trace!(state = ?actual, "was woken during registration");

            let waker = self.waker.with_mut(|waker| {
                // Safety: the waking thread observed REGISTERING and left the
                // slot alone, so it is still exclusively ours.
                unsafe { (*waker).take() }
            });
            self.fetch_and(State::WAITING, Ordering::AcqRel);

            // no need to wake ourselves, we are about to report the wakeup
            drop(waker);
            return Poll::Ready(());
        }

        // waker registered, time to yield!
        Poll::Pending
    }

    /// Wait to be woken up by this cell.
    ///
    /// Note that the calling task's [`Waker`] is not registered until the
    /// returned [`Wait`] future is polled for the first time; a wakeup
    /// arriving before that is still observed, because wakeups on an empty
    /// cell are stored.
    pub fn wait(&self) -> Wait<'_> {
        Wait { cell: self }
    }

    /// Wake the [`Waker`] stored in this cell.
    ///
    /// # Returns
    ///
    /// - `true` if a waiting task was woken.
    /// - `false` if no task was woken (no [`Waker`] was stored in the cell);
    ///   the wakeup is stored for the next [`poll_wait`][Self::poll_wait].
    #[tracing::instrument(level = "trace")]
    pub fn wake(&self) -> bool {
        if let Some(waker) = self.take_waker() {
            waker.wake();
            true
        } else {
            false
        }
    }

    fn take_waker(&self) -> Option<Waker> {
        // Set WAKING (we are touching the waker slot) and WOKEN (the wakeup
        // must be observed even if nobody registered yet).
        let state = self.fetch_or(State::WAKING | State::WOKEN, Ordering::AcqRel);

        // Is anyone else touching the waker?
        if !state.intersects(State::WAKING | State::REGISTERING) {
            let waker = self.waker.with_mut(|waker| {
                // Safety: the WAKING bit excludes every other accessor of the
                // waker slot.
                unsafe { (*waker).take() }
            });

            // Release the wake lock.
            self.fetch_and(!State::WAKING, Ordering::Release);

            if let Some(waker) = waker {
                tracing::trace!(wait_cell = ?self, ?waker, "notified");
                return Some(waker);
            }
        }

        None
    }

    #[inline(always)]
    fn compare_exchange(
        &self,
        curr: State,
        new: State,
        success: Ordering,
    ) -> Result<State, State> {
        self.state
            .0
            .compare_exchange(curr.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.0.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.0.fetch_or(state.bits(), order))
    }

    #[inline(always)]
    fn current_state(&self) -> State {
        State::from_bits_retain(self.state.0.load(Ordering::Acquire))
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        WaitCell::new()
    }
}

// Safety: `WaitCell` synchronizes all accesses through atomic operations
unsafe impl Send for WaitCell {}
// Safety: `WaitCell` synchronizes all accesses through atomic operations
unsafe impl Sync for WaitCell {}

impl fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCell")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.cell.poll_wait(cx)
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::future;
    use loom::thread;
    use std::sync::Arc;

    #[test]
    fn wake_and_wait_race() {
        loom::model(|| {
            let cell = Arc::new(WaitCell::new());

            let waker = cell.clone();
            let t = thread::spawn(move || {
                waker.wake();
            });

            // regardless of whether the wake lands before, during, or after
            // registration, the wait must complete
            future::block_on(cell.wait());
            t.join().unwrap();
        });
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio_test::{assert_pending, assert_ready, task};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn wait_smoke() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let wait = Arc::new(WaitCell::new());

        let mut task = task::spawn({
            let wait = wait.clone();
            async move { wait.wait().await }
        });

        assert_pending!(task.poll());

        assert!(wait.wake());

        assert!(task.is_woken());
        assert_ready!(task.poll());
    }

    #[test]
    fn wake_before_wait() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let cell = Arc::new(WaitCell::new());
        assert!(!cell.wake());

        let mut task = task::spawn({
            let cell = cell.clone();
            async move { cell.wait().await }
        });

        assert_ready!(task.poll(), "stored wakeup should complete the wait");
    }

    #[test]
    fn wake_debounce() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let cell = Arc::new(WaitCell::new());

        let mut task = task::spawn({
            let cell = cell.clone();
            async move { cell.wait().await }
        });

        assert_pending!(task.poll());
        cell.wake();
        cell.wake();
        assert!(task.is_woken());
        assert_ready!(task.poll());
    }

    #[test]
    fn repolling_reregisters() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let cell = Arc::new(WaitCell::new());

        let mut task = task::spawn({
            let cell = cell.clone();
            async move { cell.wait().await }
        });

        assert_pending!(task.poll(), "first poll should be pending");
        assert_pending!(task.poll(), "second poll should be pending");

        cell.wake();

        assert_ready!(task.poll(), "should have been woken");
    }
}
