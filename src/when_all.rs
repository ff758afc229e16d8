// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fan-out/fan-in combinator: start N computations concurrently, resume
//! one waiter once all N have finished.

use crate::error::JoinError;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::synced::{Notify, Synced};
use crate::sync::WaitCell;
use crate::util::CachePadded;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;

/// Fan-in synchronization: a countdown shared by N constituent tasks and the
/// single waiter.
///
/// The counter starts at N + 1. Each completing constituent decrements it;
/// the waiter registers its continuation and then performs the final "+1"
/// decrement exactly once when it attaches. Whichever decrement reaches zero
/// resumes the waiter — the attacher itself if everything had already
/// finished, or the last-finishing constituent through the wait cell.
pub struct Countdown {
    remaining: CachePadded<AtomicUsize>,
    waiter: WaitCell,
}

impl Countdown {
    fn new(tasks: usize) -> Self {
        Self {
            // +1 for attaching the continuation
            remaining: CachePadded(AtomicUsize::new(tasks + 1)),
            waiter: WaitCell::new(),
        }
    }

    /// The attach decrement. Returns `true` if every constituent had already
    /// completed and the waiter must not suspend.
    fn attach(&self) -> bool {
        self.remaining.0.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn is_done(&self) -> bool {
        self.remaining.0.load(Ordering::Acquire) == 0
    }
}

impl Notify for Countdown {
    fn notify_complete(&self) {
        if self.remaining.0.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::trace!("final constituent completed, waking fan-in waiter");
            self.waiter.wake();
        }
    }
}

impl core::fmt::Debug for Countdown {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Countdown")
            .field("remaining", &self.remaining.0.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A set of computations [`when_all`] can fan out over.
///
/// Implemented for tuples of futures up to arity 8 (heterogeneous outputs,
/// aggregated positionally) and for `Vec<F>` (homogeneous outputs, collected
/// in input order).
pub trait TaskSet {
    /// The started, in-flight form of the set.
    type InFlight;
    /// The aggregate produced once every constituent has completed.
    type Output;

    /// Number of constituents.
    fn count(&self) -> usize;

    /// Starts every constituent, each wired to decrement `countdown` on
    /// completion.
    fn start(self, countdown: &Arc<Countdown>) -> Self::InFlight;

    /// Collects the stored outcomes, in input order.
    fn collect(inflight: Self::InFlight) -> Result<Self::Output, JoinError>;
}

/// Future returned by [`when_all`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WhenAll<S: TaskSet> {
    pending: Option<S>,
    inflight: Option<S::InFlight>,
    countdown: Arc<Countdown>,
    attached: bool,
}

/// Starts all computations in `tasks` concurrently and resumes the caller
/// once every one of them has completed.
///
/// Each constituent is started on the polling thread and, if it suspends,
/// continues on whatever thread wakes it; completion order among the
/// constituents is unspecified. The aggregate is only observable after *all*
/// constituents have stored their results, and result positions always match
/// input positions regardless of completion order.
///
/// # Failure policy
///
/// Collection is fail-fast-on-read: the first stored failure *in input
/// order* is returned, and in-flight siblings are neither cancelled nor
/// waited on for additional failures. Callers wanting eager teardown should
/// compose their constituents with a shared
/// [`CancellationToken`][crate::CancellationToken].
pub fn when_all<S: TaskSet>(tasks: S) -> WhenAll<S> {
    let countdown = Arc::new(Countdown::new(tasks.count()));
    WhenAll {
        pending: Some(tasks),
        inflight: None,
        countdown,
        attached: false,
    }
}

// === impl WhenAll ===

// in-flight constituents live behind `Arc`s; nothing here is
// address-sensitive
impl<S: TaskSet> Unpin for WhenAll<S> {}

impl<S: TaskSet> Future for WhenAll<S> {
    type Output = Result<S::Output, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(tasks) = this.pending.take() {
            tracing::trace!(tasks = tasks.count(), "starting fan-out");
            this.inflight = Some(tasks.start(&this.countdown));
        }

        if !this.attached {
            // Register the continuation first, then perform the attach
            // decrement: the final completion must always find the waker.
            let _registered = this.countdown.waiter.poll_wait(cx);
            debug_assert!(_registered.is_pending());
            this.attached = true;

            if this.countdown.attach() {
                let inflight = this.inflight.take().expect("`WhenAll` polled after completion");
                return Poll::Ready(S::collect(inflight));
            }
            return Poll::Pending;
        }

        loop {
            if this.countdown.is_done() {
                let inflight = this.inflight.take().expect("`WhenAll` polled after completion");
                return Poll::Ready(S::collect(inflight));
            }
            core::task::ready!(this.countdown.waiter.poll_wait(cx));
        }
    }
}

impl<F> TaskSet for Vec<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    type InFlight = Vec<Synced<F, Arc<Countdown>>>;
    type Output = Vec<F::Output>;

    fn count(&self) -> usize {
        self.len()
    }

    fn start(self, countdown: &Arc<Countdown>) -> Self::InFlight {
        self.into_iter()
            .map(|future| {
                let task = Synced::new(future, Arc::clone(countdown));
                task.start();
                task
            })
            .collect()
    }

    fn collect(inflight: Self::InFlight) -> Result<Self::Output, JoinError> {
        inflight.into_iter().map(|task| task.take_outcome()).collect()
    }
}

macro_rules! impl_task_set {
    ($count:literal; $($F:ident => $idx:tt),+) => {
        impl<$($F),+> TaskSet for ($($F,)+)
        where
            $(
                $F: Future + Send + 'static,
                <$F as Future>::Output: Send + 'static,
            )+
        {
            type InFlight = ($(Synced<$F, Arc<Countdown>>,)+);
            type Output = ($(<$F as Future>::Output,)+);

            fn count(&self) -> usize {
                $count
            }

            fn start(self, countdown: &Arc<Countdown>) -> Self::InFlight {
                let started = ($(Synced::new(self.$idx, Arc::clone(countdown)),)+);
                $(started.$idx.start();)+
                started
            }

            fn collect(inflight: Self::InFlight) -> Result<Self::Output, JoinError> {
                Ok(($(inflight.$idx.take_outcome()?,)+))
            }
        }
    };
}

impl_task_set!(1; F1 => 0);
impl_task_set!(2; F1 => 0, F2 => 1);
impl_task_set!(3; F1 => 0, F2 => 1, F3 => 2);
impl_task_set!(4; F1 => 0, F2 => 1, F3 => 2, F4 => 3);
impl_task_set!(5; F1 => 0, F2 => 1, F3 => 2, F4 => 3, F5 => 4);
impl_task_set!(6; F1 => 0, F2 => 1, F3 => 2, F4 => 3, F5 => 4, F6 => 5);
impl_task_set!(7; F1 => 0, F2 => 1, F3 => 2, F4 => 3, F5 => 4, F6 => 5, F7 => 6);
impl_task_set!(8; F1 => 0, F2 => 1, F3 => 2, F4 => 3, F5 => 4, F6 => 5, F7 => 6, F8 => 7);

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::executor::{ThreadPerTask, offload_on};
    use crate::sync_wait;
    use core::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// A constituent that completes on a worker thread after `delay_ms`.
    fn staggered(value: usize, delay_ms: u64) -> impl Future<Output = usize> + Send + 'static {
        async move {
            offload_on(ThreadPerTask, move || {
                thread::sleep(Duration::from_millis(delay_ms));
                value
            })
            .await
            .unwrap()
        }
    }

    #[test]
    fn tuple_aggregates_positionally() {
        let out = sync_wait(async {
            when_all((async { 1 }, async { 2 }, async { 3 })).await
        });
        assert_eq!(out.unwrap(), (1, 2, 3));
    }

    #[test]
    fn heterogeneous_tuple() {
        let out = sync_wait(async {
            when_all((async { 1u8 }, async { "two" }, async {})).await
        });
        assert_eq!(out.unwrap(), (1u8, "two", ()));
    }

    #[test]
    fn result_order_matches_input_order_not_completion_order() {
        // task 0 finishes last, the highest-numbered task finishes first
        let tasks: Vec<_> = (0..4).map(|i| staggered(i, 80 - 20 * i as u64)).collect();
        let out = sync_wait(async { when_all(tasks).await });
        assert_eq!(out.unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn aggregate_observable_only_after_all_complete() {
        static FINISHED: AtomicUsize = AtomicUsize::new(0);

        let tasks: Vec<_> = (0..3)
            .map(|i| async move {
                offload_on(ThreadPerTask, move || {
                    thread::sleep(Duration::from_millis(10 * i as u64));
                    FINISHED.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            })
            .collect();

        sync_wait(async { when_all(tasks).await }).unwrap();
        assert_eq!(FINISHED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failing_element_is_reported_not_hung() {
        let out = sync_wait(async {
            when_all((
                async { 1 },
                async {
                    panic!("element failed");
                },
                staggered(3, 10),
            ))
            .await
        });
        let err = out.unwrap_err();
        assert!(err.is_panic());
    }

    #[test]
    fn all_void_list() {
        let tasks: Vec<_> = (0..3).map(|_| async {}).collect();
        let out = sync_wait(async { when_all(tasks).await });
        assert_eq!(out.unwrap(), vec![(), (), ()]);
    }

    #[test]
    fn empty_list_completes_immediately() {
        let out = sync_wait(async { when_all(Vec::<core::future::Ready<u32>>::new()).await });
        assert_eq!(out.unwrap(), vec![]);
    }

    #[test]
    fn spec_scenario_one_two_three() {
        // `when_all(task_returning(1), task_returning(2), task_returning(3))`
        // blocking-waited yields `(1, 2, 3)`.
        let out = sync_wait(async {
            when_all((staggered(1, 30), staggered(2, 20), staggered(3, 10))).await
        });
        assert_eq!(out.unwrap(), (1, 2, 3));
    }
}
