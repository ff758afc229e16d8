// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The detached-work launcher and its pluggable execution substrate.

use crate::error::{JoinError, catch};
use crate::loom::cell::UnsafeCell;
use crate::storage::Outcome;
use crate::sync::WaitCell;
use core::mem;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;

/// A unit of work handed to an [`Executor`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// An execution substrate: accepts a zero-argument closure and eventually
/// runs it.
///
/// [`offload`] needs *something* to run callables on; this trait is the seam
/// where a real scheduler plugs in. The crate ships [`ThreadPerTask`] as a
/// deliberately naive default — anything smarter (a bounded pool, a priority
/// scheduler, a test harness that runs work inline) implements this trait
/// and goes through [`offload_on`].
pub trait Executor: Send + Sync {
    /// Accepts `work` to be run at some point, on some thread.
    fn execute(&self, work: Work);
}

impl<E: Executor> Executor for Arc<E> {
    fn execute(&self, work: Work) {
        E::execute(self, work);
    }
}

impl<E: Executor> Executor for &'static E {
    fn execute(&self, work: Work) {
        E::execute(self, work);
    }
}

/// Placeholder substrate: spawns one detached OS thread per unit of work.
///
/// One thread per operation is exactly as expensive as it sounds; it exists
/// so the launcher works out of the box. Inject a pooled [`Executor`] via
/// [`offload_on`] for anything beyond casual use.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPerTask;

impl Executor for ThreadPerTask {
    fn execute(&self, work: Work) {
        tracing::trace!("spawning a dedicated worker thread");
        crate::loom::thread::spawn(move || work());
    }
}

/// Block shared between the launcher future and the worker running its
/// callable.
struct Shared<T> {
    /// Written by the worker, then read by the single awaiter.
    slot: UnsafeCell<Outcome<T>>,
    /// Holds the awaiter's continuation.
    waiter: WaitCell,
}

// Safety: the WaitCell wake/poll protocol orders all slot accesses: the
// worker writes before `wake`, the awaiter reads only after observing the
// wakeup.
unsafe impl<T: Send> Send for Shared<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Shared<T> {}

enum LaunchState<T, E> {
    /// The callable has not been handed to the substrate yet; that happens
    /// at the first poll.
    Unlaunched {
        func: Box<dyn FnOnce() -> T + Send>,
        exec: E,
    },
    /// The callable is (or has finished) running elsewhere.
    Launched { shared: Arc<Shared<T>> },
    /// The outcome was delivered.
    Finished,
}

/// Future returned by [`offload`] and [`offload_on`].
///
/// The wrapped callable starts on its substrate when this future is first
/// polled, and the future resumes once the callable returned (or panicked)
/// — typically on a *different* thread than the one that suspended.
///
/// An `Offload` is awaited exactly once: awaiting consumes it, and polling
/// it again after completion panics.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Offload<T, E = ThreadPerTask> {
    state: LaunchState<T, E>,
}

/// Runs `func` off the calling context on a freshly spawned thread, exposing
/// it as a future.
///
/// Equivalent to [`offload_on`]`(ThreadPerTask, func)`.
pub fn offload<T, F>(func: F) -> Offload<T, ThreadPerTask>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    offload_on(ThreadPerTask, func)
}

/// Runs `func` on the given [`Executor`], exposing it as a future.
///
/// The callable is dispatched lazily, when the returned future is first
/// polled. When it returns (or panics) the stored outcome is delivered to
/// the single awaiter; the awaiter must not assume it resumes on the thread
/// it suspended on.
pub fn offload_on<E, T, F>(executor: E, func: F) -> Offload<T, E>
where
    E: Executor,
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Offload {
        state: LaunchState::Unlaunched {
            func: Box::new(func),
            exec: executor,
        },
    }
}

// === impl Offload ===

// nothing in the launch state is address-sensitive
impl<T, E> Unpin for Offload<T, E> {}

impl<T, E> Future for Offload<T, E>
where
    T: Send + 'static,
    E: Executor,
{
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if matches!(this.state, LaunchState::Unlaunched { .. }) {
            let LaunchState::Unlaunched { func, exec } =
                mem::replace(&mut this.state, LaunchState::Finished)
            else {
                unreachable!()
            };

            let shared = Arc::new(Shared {
                slot: UnsafeCell::new(Outcome::new()),
                waiter: WaitCell::new(),
            });

            // Register the continuation *before* dispatching, so the
            // completion wakeup can never be missed.
            let _registered = shared.waiter.poll_wait(cx);
            debug_assert!(_registered.is_pending());

            let worker = Arc::clone(&shared);
            tracing::trace!("dispatching offloaded work");
            exec.execute(Box::new(move || {
                let result = catch(func);
                worker.slot.with_mut(|slot| {
                    // Safety: the awaiter does not touch the slot until the
                    // `wake` below.
                    unsafe { (*slot).fulfill(result) };
                });
                worker.waiter.wake();
            }));

            this.state = LaunchState::Launched { shared };
            return Poll::Pending;
        }

        let output = match &this.state {
            LaunchState::Launched { shared } => {
                core::task::ready!(shared.waiter.poll_wait(cx));
                shared.slot.with_mut(|slot| {
                    // Safety: the wakeup happens-after the worker's write,
                    // and we are the single consumer.
                    unsafe { (*slot).take() }
                })
            }
            LaunchState::Finished => panic!("`Offload` polled after completion"),
            LaunchState::Unlaunched { .. } => unreachable!(),
        };

        this.state = LaunchState::Finished;
        Poll::Ready(output)
    }
}

impl<T, E> core::fmt::Debug for Offload<T, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match &self.state {
            LaunchState::Unlaunched { .. } => "Unlaunched",
            LaunchState::Launched { .. } => "Launched",
            LaunchState::Finished => "Finished",
        };
        f.debug_struct("Offload").field("state", &state).finish()
    }
}
