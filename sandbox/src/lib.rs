// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The sandbox runtime driver contract and the Sandbox Pool & Dispatcher (C3) built on top of
//! it: one warm pool per language, MRU reuse, background eviction, and a pluggable concrete
//! driver (`docker`, or `fake` for tests).

pub mod docker;
pub mod driver;
pub mod error;
pub mod fake;
pub mod pool;

pub use driver::{ChildOutput, ExecHandle, Limits, NetworkId, SandboxId, SandboxRuntime, Signal};
pub use error::SandboxError;
pub use pool::{Lease, LeaseId, ReleaseOutcome, SandboxPool, SandboxState};
