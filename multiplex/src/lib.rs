// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The I/O Multiplexer (C5): the process-wide router between connected sessions and running
//! jobs. Owns the outbound frame queues (with drop-oldest backpressure) and the stdin routes; the
//! gateway and the execution pipeline only ever interact with each other through this crate.

pub mod frame;
mod multiplexer;
mod outbound;

pub use frame::{ExitReason, Frame};
pub use multiplexer::{Multiplexer, StdinOutcome};
