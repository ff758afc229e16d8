// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Self-driving task wrapper used by the fan-in combinator and the
//! synchronous bridge.
//!
//! A [`Synced`] owns a future and drives it to completion *wherever its
//! wakeups land*: [`start`][Synced::start] polls inline on the calling
//! thread, and every later wakeup re-polls on the waking thread. When the
//! future completes (or panics), the outcome is stored and the attached
//! [`Notify`] fires exactly once. This is the poll-based rendition of
//! "completion directly resumes the waiter" — no intermediate scheduler loop
//! is involved.

use crate::error::{JoinError, catch};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::storage::Outcome;
use crate::util::CachePadded;
use bitflags::bitflags;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use static_assertions::const_assert_eq;
use std::sync::Arc;
use std::task::Wake;

/// Completion hook fired exactly once when a [`Synced`] computation
/// finishes.
///
/// This is the seam between a synchronized task and whoever is waiting on
/// it: the fan-in countdown decrements through it, the blocking bridge's
/// latch unparks through it.
pub(crate) trait Notify: Send + Sync + 'static {
    fn notify_complete(&self);
}

impl<N: Notify> Notify for Arc<N> {
    fn notify_complete(&self) {
        N::notify_complete(self);
    }
}

bitflags! {
    /// Run-state of a synchronized task.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct RunState: usize {
        /// Not running and not scheduled; a wakeup claims the task.
        const IDLE = 0b000;
        /// Some thread is currently polling the future. The bit functions as
        /// a lock on the future and outcome cells.
        const RUNNING = 0b001;
        /// A wakeup arrived while RUNNING; the polling thread must poll
        /// again before releasing the task.
        const NOTIFIED = 0b010;
        /// The outcome is stored. Terminal.
        const COMPLETE = 0b100;
    }
}
// IDLE must be zero
const_assert_eq!(RunState::IDLE.bits(), 0);

/// Handle to a synchronized task. See the module docs.
pub struct Synced<F: Future, N> {
    core: Arc<Core<F, N>>,
}

struct Core<F: Future, N> {
    state: CachePadded<AtomicUsize>,

    /// The wrapped future, dropped in place on completion.
    ///
    /// Guarded by the RUNNING bit: only the thread that set it may touch
    /// this cell.
    future: UnsafeCell<Option<F>>,

    /// The eventual outcome.
    ///
    /// Written under the RUNNING bit, read by the consumer only after it
    /// observed COMPLETE (Acquire), which the writer set with Release.
    outcome: UnsafeCell<Outcome<F::Output>>,

    notify: N,
}

// Safety: access to the future and outcome cells is serialized by the
// RUNNING/COMPLETE state protocol.
unsafe impl<F, N> Send for Core<F, N>
where
    F: Future + Send,
    F::Output: Send,
    N: Send + Sync,
{
}
// Safety: access to the future and outcome cells is serialized by the
// RUNNING/COMPLETE state protocol.
unsafe impl<F, N> Sync for Core<F, N>
where
    F: Future + Send,
    F::Output: Send,
    N: Send + Sync,
{
}

// === impl Synced ===

impl<F, N> Synced<F, N>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    N: Notify,
{
    pub(crate) fn new(future: F, notify: N) -> Self {
        Self {
            core: Arc::new(Core {
                state: CachePadded(AtomicUsize::new(RunState::IDLE.bits())),
                future: UnsafeCell::new(Some(future)),
                outcome: UnsafeCell::new(Outcome::new()),
                notify,
            }),
        }
    }

    /// Starts the computation, polling inline on the calling thread until it
    /// completes or suspends.
    ///
    /// May be called at most once, before any waker for this task exists.
    pub(crate) fn start(&self) {
        self.core
            .compare_exchange(RunState::IDLE, RunState::RUNNING)
            .expect("synchronized task started twice, this is a bug!");
        Core::run(&self.core);
    }

    /// Moves the stored outcome out of the task.
    ///
    /// The caller must have observed completion through its [`Notify`] (or
    /// this panics loudly).
    pub(crate) fn take_outcome(&self) -> Result<F::Output, JoinError> {
        let state = self.core.load(Ordering::Acquire);
        assert!(
            state.contains(RunState::COMPLETE),
            "synchronized task outcome read before completion"
        );
        self.core.outcome.with_mut(|outcome| {
            // Safety: COMPLETE is terminal and was published with Release;
            // the single consumer has exclusive slot access from here on.
            unsafe { (*outcome).take() }
        })
    }
}

// === impl Core ===

impl<F, N> Core<F, N>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    N: Notify,
{
    /// Called on every wakeup: claim the task and poll it on this thread, or
    /// leave a note for the thread already polling it.
    fn wake_task(this: &Arc<Self>) {
        let mut current = this.load(Ordering::Acquire);
        loop {
            if current.contains(RunState::COMPLETE) {
                // stray wakeup after completion
                return;
            }
            let (next, poll_now) = if current.contains(RunState::RUNNING) {
                (current | RunState::NOTIFIED, false)
            } else {
                (RunState::RUNNING, true)
            };
            match this.compare_exchange(current, next) {
                Ok(_) => {
                    if poll_now {
                        tracing::trace!("waking synchronized task, polling here");
                        Self::run(this);
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Polls the future until it suspends without a pending notification, or
    /// completes. The caller must hold the RUNNING bit.
    fn run(this: &Arc<Self>) {
        let waker = Waker::from(Arc::clone(this));
        let mut cx = Context::from_waker(&waker);

        loop {
            let poll = this.future.with_mut(|future| {
                // Safety: the RUNNING bit grants this thread exclusive access
                // to the future cell.
                let future = unsafe {
                    (*future)
                        .as_mut()
                        .expect("synchronized task polled after completion")
                };
                // Safety: the future lives in the arc'd control block and is
                // never moved out of it until dropped in place.
                let future = unsafe { Pin::new_unchecked(future) };
                catch(|| future.poll(&mut cx))
            });

            match poll {
                Ok(Poll::Pending) => {
                    // Try to go back to sleep. If a notification raced in
                    // while we were polling, consume it and poll again.
                    match this.compare_exchange(RunState::RUNNING, RunState::IDLE) {
                        Ok(_) => return,
                        Err(actual) => {
                            debug_assert!(actual.contains(RunState::NOTIFIED));
                            let _cleared = this.compare_exchange(
                                RunState::RUNNING | RunState::NOTIFIED,
                                RunState::RUNNING,
                            );
                            debug_assert!(_cleared.is_ok(), "unexpected run-state transition");
                        }
                    }
                }
                Ok(Poll::Ready(value)) => return Self::complete(this, Ok(value)),
                Err(failure) => return Self::complete(this, Err(failure)),
            }
        }
    }

    fn complete(this: &Arc<Self>, result: Result<F::Output, JoinError>) {
        this.future.with_mut(|future| {
            // Safety: still under the RUNNING bit. The future is dropped in
            // place before the outcome is published so its borrows end
            // first.
            unsafe { *future = None };
        });
        this.outcome.with_mut(|outcome| {
            // Safety: still under the RUNNING bit.
            unsafe { (*outcome).fulfill(result) };
        });
        this.state
            .0
            .store(RunState::COMPLETE.bits(), Ordering::Release);

        tracing::trace!("synchronized task complete, notifying");
        this.notify.notify_complete();
    }

    #[inline(always)]
    fn load(&self, order: Ordering) -> RunState {
        RunState::from_bits_retain(self.state.0.load(order))
    }

    #[inline(always)]
    fn compare_exchange(&self, curr: RunState, new: RunState) -> Result<RunState, RunState> {
        self.state
            .0
            .compare_exchange(curr.bits(), new.bits(), Ordering::AcqRel, Ordering::Acquire)
            .map(RunState::from_bits_retain)
            .map_err(RunState::from_bits_retain)
    }
}

impl<F, N> Wake for Core<F, N>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    N: Notify,
{
    fn wake(self: Arc<Self>) {
        Self::wake_task(&self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Self::wake_task(self);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountNotify(AtomicUsize);

    impl Notify for CountNotify {
        fn notify_complete(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Wakes itself once mid-poll, then completes. Exercises the NOTIFIED
    /// re-poll path without leaving the calling thread.
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = u32;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u32> {
            if self.0 {
                Poll::Ready(99)
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    #[test]
    fn completes_inline() {
        let notify = Arc::new(CountNotify(AtomicUsize::new(0)));
        let task = Synced::new(async { 5 }, notify.clone());

        task.start();

        assert_eq!(notify.0.load(Ordering::SeqCst), 1);
        assert_eq!(task.take_outcome().unwrap(), 5);
    }

    #[test]
    fn self_wake_repolls_on_the_same_thread() {
        let notify = Arc::new(CountNotify(AtomicUsize::new(0)));
        let task = Synced::new(YieldOnce(false), notify.clone());

        task.start();

        assert_eq!(notify.0.load(Ordering::SeqCst), 1);
        assert_eq!(task.take_outcome().unwrap(), 99);
    }

    #[test]
    fn stores_panics_and_still_notifies() {
        let notify = Arc::new(CountNotify(AtomicUsize::new(0)));
        let task = Synced::new(
            async {
                panic!("inner");
            },
            notify.clone(),
        );

        task.start();

        assert_eq!(notify.0.load(Ordering::SeqCst), 1);
        assert!(task.take_outcome().unwrap_err().is_panic());
    }

    #[test]
    #[should_panic(expected = "read before completion")]
    fn premature_outcome_read_fails_loudly() {
        let notify = Arc::new(CountNotify(AtomicUsize::new(0)));
        let task = Synced::new(std::future::pending::<()>(), notify);
        let _ = task.take_outcome();
    }
}
