// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The blocking bridge out of the cooperative-suspension world.

use crate::error::WaitTimeout;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::park::{Park, StdPark};
use crate::synced::{Notify, Synced};
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

/// One-shot completion latch: a done flag plus the parker of the thread
/// blocked on it.
struct Latch<P> {
    done: AtomicBool,
    park: P,
}

impl<P: Park> Latch<P> {
    fn new(park: P) -> Self {
        Self {
            done: AtomicBool::new(false),
            park,
        }
    }

    fn wait(&self) {
        while !self.done.load(Ordering::Acquire) {
            self.park.park();
        }
    }

    fn wait_for(&self, timeout: Duration) -> Result<(), WaitTimeout> {
        let deadline = Instant::now() + timeout;
        while !self.done.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitTimeout(()));
            }
            self.park.park_timeout(deadline - now);
        }
        Ok(())
    }
}

impl<P: Park + 'static> Notify for Latch<P> {
    fn notify_complete(&self) {
        self.done.store(true, Ordering::Release);
        self.park.unpark();
    }
}

/// Drives `future` to completion from a plain (non-cooperative) calling
/// context, returning its output.
///
/// The future is wrapped in an internally managed completion task: the first
/// poll runs inline on the calling thread, and if the computation suspends,
/// every later poll happens on whichever thread wakes it while this thread
/// blocks on a one-shot latch. A computation that finishes on its first poll
/// returns without blocking at all.
///
/// A panic stored by the computation is resumed on the calling thread, as if
/// the computation had run here.
pub fn sync_wait<F>(future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let latch = Arc::new(Latch::new(StdPark::for_current()));
    let task = Synced::new(future, Arc::clone(&latch));

    tracing::trace!("starting synchronously awaited task");
    task.start();
    latch.wait();

    match task.take_outcome() {
        Ok(value) => value,
        Err(failure) => failure.resume(),
    }
}

/// Like [`sync_wait`], but gives up once `timeout` elapses.
///
/// On timeout the computation is *not* interrupted — cancellation in this
/// crate is strictly cooperative — it keeps running detached on whatever
/// thread wakes it, and its eventual outcome is discarded. Note that the
/// abandoned completion may leave a stray unpark token on this thread;
/// parking callers must already tolerate spurious wakeups.
pub fn sync_wait_for<F>(future: F, timeout: Duration) -> Result<F::Output, WaitTimeout>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let latch = Arc::new(Latch::new(StdPark::for_current()));
    let task = Synced::new(future, Arc::clone(&latch));

    tracing::trace!(?timeout, "starting synchronously awaited task");
    task.start();
    latch.wait_for(timeout)?;

    match task.take_outcome() {
        Ok(value) => Ok(value),
        Err(failure) => failure.resume(),
    }
}
