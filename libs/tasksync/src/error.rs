// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;

/// Error returned when triggering or otherwise operating on a
/// [`PredicatedCondition`] that has already been destroyed.
///
/// [`PredicatedCondition`]: crate::sync::PredicatedCondition
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Destroyed(pub(crate) ());

impl fmt::Display for Destroyed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("sync object destroyed")
    }
}

impl core::error::Error for Destroyed {}

/// Failure modes of a [`PredicatedCondition`] wait.
///
/// Distinguishes "the object was already gone when the wait was attempted"
/// ([`WaitError::AlreadyDestroyed`]) from "the wait started and the object was
/// destroyed underneath it" ([`WaitError::Destroyed`]).
///
/// [`PredicatedCondition`]: crate::sync::PredicatedCondition
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitError {
    /// The condition was already destroyed at the point of the call.
    AlreadyDestroyed,
    /// The condition was destroyed while this caller was waiting.
    Destroyed,
    /// The configured timeout elapsed before the predicate was satisfied.
    Timeout,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::AlreadyDestroyed => f.write_str("wait attempted on a destroyed condition"),
            WaitError::Destroyed => f.write_str("condition destroyed while waiting"),
            WaitError::Timeout => f.write_str("wait timed out"),
        }
    }
}

impl core::error::Error for WaitError {}

/// A joined task panicked.
///
/// Carries the panic payload so the joining context can re-raise or inspect
/// it, mirroring how the panic would have surfaced had the body run inline.
pub struct JoinError(pub(crate) Box<dyn Any + Send + 'static>);

impl JoinError {
    /// Consumes the error, returning the panic payload.
    #[must_use]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.0
    }

    /// The panic message, if the payload was a string.
    #[must_use]
    pub fn panic_message(&self) -> Option<&str> {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            Some(s)
        } else {
            self.0.downcast_ref::<String>().map(String::as_str)
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JoinError")
            .field(&self.panic_message().unwrap_or("..."))
            .finish()
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.panic_message() {
            Some(msg) => write!(f, "task panicked: {msg}"),
            None => f.write_str("task panicked"),
        }
    }
}

impl core::error::Error for JoinError {}

/// Error returned by [`timeout`] when the inner future does not complete
/// before the deadline.
///
/// [`timeout`]: crate::time::timeout
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Elapsed(pub(crate) ());

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("deadline elapsed")
    }
}

impl core::error::Error for Elapsed {}
