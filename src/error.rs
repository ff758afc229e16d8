// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;
use std::panic::{self, AssertUnwindSafe};

/// A computation driven by this crate terminated abnormally.
///
/// The failure is captured into the computation's result slot and replayed
/// exactly once to its single consumer; it is never logged or dropped
/// internally.
pub enum JoinError {
    /// The computation panicked. The payload is preserved so the consumer can
    /// inspect it or [resume][JoinError::resume] the unwind.
    Panic(Box<dyn Any + Send + 'static>),

    /// The computation unwound with a cancellation signal.
    ///
    /// Transport is identical to [`Panic`][JoinError::Panic]; the distinction
    /// is purely semantic ("the caller asked us to stop").
    Cancelled(Cancelled),
}

impl JoinError {
    /// Returns `true` if the computation panicked.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panic(_))
    }

    /// Returns `true` if the computation unwound due to cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled(_))
    }

    /// Consumes the error, returning the captured panic payload.
    #[must_use]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            JoinError::Panic(payload) => payload,
            JoinError::Cancelled(cancelled) => Box::new(cancelled),
        }
    }

    /// Consumes the error and resumes the captured unwind on the current
    /// thread.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.into_panic())
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panic(_) => f.write_str("JoinError::Panic(..)"),
            JoinError::Cancelled(_) => f.write_str("JoinError::Cancelled"),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panic(_) => f.write_str("computation panicked"),
            JoinError::Cancelled(_) => f.write_str("computation was cancelled"),
        }
    }
}

impl core::error::Error for JoinError {}

/// Error signalled by cooperative cancellation checks.
///
/// Returned by [`CancellationToken::check`][crate::CancellationToken::check]
/// once cancellation has been requested. Computations must poll for it; there
/// is no forced preemption anywhere in this crate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cancelled(pub(crate) ());

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("operation cancelled")
    }
}

impl core::error::Error for Cancelled {}

/// The deadline passed to [`sync_wait_for`][crate::sync_wait_for] elapsed
/// before the awaited computation completed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaitTimeout(pub(crate) ());

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("timed out waiting for completion")
    }
}

impl core::error::Error for WaitTimeout {}

/// Runs `f`, converting an unwind into the stored-failure representation.
///
/// A payload that is a [`Cancelled`] becomes [`JoinError::Cancelled`]; every
/// other payload is preserved as [`JoinError::Panic`].
pub(crate) fn catch<T>(f: impl FnOnce() -> T) -> Result<T, JoinError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<Cancelled>() {
            Ok(cancelled) => Err(JoinError::Cancelled(*cancelled)),
            Err(payload) => Err(JoinError::Panic(payload)),
        },
    }
}
