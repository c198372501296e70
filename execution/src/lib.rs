// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Admission Queue (C2) and Execution Pipeline (C4): everything between an accepted `run`
//! request and a terminal `exit` frame. Built on the sandbox pool (C3), the I/O multiplexer (C5),
//! and the telemetry recorder (C6); the session gateway (C1) is this crate's only caller.

pub mod admission;
pub mod error;
pub mod language;
pub mod pipeline;
pub mod request;

pub use admission::{AdmissionQueue, AdmissionTicket};
pub use error::{PipelineError, RejectionKind};
pub use language::{LanguageProfile, LanguageProfiles};
pub use pipeline::{validate_files, JobOutcome, Pipeline};
pub use request::{ExecutionRequest, JobLimits, Source};
