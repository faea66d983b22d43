// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timers and deadlines: the shared [`Timer`] service, [`sleep`], and the
//! [`timeout`] combinator.

mod timeout;
mod timer;

pub use crate::error::Elapsed;
pub use timeout::{Sleep, Timeout, sleep, timeout};
pub use timer::Timer;
