// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The single-owner, lazily started task type.

use crate::error::{JoinError, catch};
use crate::storage::Outcome;
use core::pin::Pin;
use core::task::{Context, Poll};

/// A uniquely owned handle to a lazily started computation and its eventual
/// single result.
///
/// Nothing runs until the task is first polled; the control block (the
/// wrapped future) lives on the heap and is destroyed when the handle is
/// dropped. Completion is terminal and happens at most once: a panic inside
/// the computation is caught and stored as a [`JoinError`] instead of
/// unwinding into the awaiter, and the stored outcome is then replayed to
/// every read without re-running anything.
///
/// There are two ways to read the outcome, mirroring the two ways a result
/// can be borrowed:
///
/// - [`join()`][Task::join] drives the task if necessary and yields the
///   outcome *by reference*; awaiting it again later simply re-reads the
///   stored result.
/// - awaiting the task itself (its [`Future`] impl) is the final *consuming*
///   read and yields the outcome by move. Polling the task again afterwards
///   panics.
///
/// Single ownership is what enforces the single-waiter contract: two tasks
/// cannot concurrently await the same `Task`, because awaiting requires
/// `&mut`/ownership.
#[must_use = "a `Task` runs nothing until it is polled"]
pub struct Task<F: Future> {
    future: Option<Pin<Box<F>>>,
    outcome: Outcome<F::Output>,
}

/// Future returned from [`Task::join()`].
///
/// Yields the task's outcome by reference, leaving it stored for later
/// reads.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Join<'a, F: Future> {
    task: Option<&'a mut Task<F>>,
}

// === impl Task ===

impl<F: Future> Task<F> {
    /// Wraps `future` into a task. The future is moved to the heap here but
    /// does not run until the task is first polled.
    pub fn new(future: F) -> Self {
        Self {
            future: Some(Box::pin(future)),
            outcome: Outcome::new(),
        }
    }

    /// Returns `true` once the computation has run to completion.
    pub fn is_complete(&self) -> bool {
        self.future.is_none()
    }

    /// Reads the stored outcome without driving the task.
    ///
    /// Returns `None` while the computation has not completed.
    pub fn try_output(&self) -> Option<Result<&F::Output, &JoinError>> {
        if self.future.is_some() {
            return None;
        }
        self.outcome.peek()
    }

    /// Drives the task to completion and reads its outcome by reference.
    ///
    /// If the task already completed, this returns the stored outcome
    /// immediately, without recomputation.
    pub fn join(&mut self) -> Join<'_, F> {
        Join { task: Some(self) }
    }

    /// Polls the underlying future, storing its output (or captured panic)
    /// on completion. Ready means "an outcome is stored".
    fn poll_stage(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(future) = self.future.as_mut() else {
            return Poll::Ready(());
        };

        match catch(|| future.as_mut().poll(cx)) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                tracing::trace!("task completed");
                self.outcome.fulfill(Ok(value));
                self.future = None;
                Poll::Ready(())
            }
            Err(failure) => {
                tracing::trace!(?failure, "task failed");
                self.outcome.fulfill(Err(failure));
                self.future = None;
                Poll::Ready(())
            }
        }
    }
}

// The future is heap-pinned, so the handle itself has no pinned state.
impl<F: Future> Unpin for Task<F> {}

impl<F: Future> Future for Task<F> {
    type Output = Result<F::Output, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if matches!(this.outcome, Outcome::Consumed) {
            panic!("`Task` polled after its output was consumed");
        }
        core::task::ready!(this.poll_stage(cx));
        Poll::Ready(this.outcome.take())
    }
}

impl<F: Future> core::fmt::Debug for Task<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("complete", &self.is_complete())
            .field("outcome", &self.outcome)
            .finish()
    }
}

// === impl Join ===

impl<'a, F: Future> Future for Join<'a, F> {
    type Output = Result<&'a F::Output, &'a JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = self
            .task
            .take()
            .expect("`Join` polled after completion");

        match task.poll_stage(cx) {
            Poll::Pending => {
                self.task = Some(task);
                Poll::Pending
            }
            Poll::Ready(()) => {
                // downgrade the exclusive borrow for the full lifetime
                let task: &'a Task<F> = task;
                match task.outcome.peek() {
                    Some(result) => Poll::Ready(result),
                    None => unreachable!("task completed without storing an outcome"),
                }
            }
        }
    }
}
