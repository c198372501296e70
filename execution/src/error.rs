// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use multiplex::ExitReason;
use serde::Serialize;

/// The closed set of `rejected.kind` values: requests that never reach C3/C4 at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionKind {
    UnknownLanguage,
    NoEntrypoint,
    MultipleEntrypoints,
    TooLarge,
    Busy,
    ServiceUnavailable,
    PathEscape,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::UnknownLanguage => "unknown-language",
            RejectionKind::NoEntrypoint => "no-entrypoint",
            RejectionKind::MultipleEntrypoints => "multiple-entrypoints",
            RejectionKind::TooLarge => "too-large",
            RejectionKind::Busy => "busy",
            RejectionKind::ServiceUnavailable => "service-unavailable",
            RejectionKind::PathEscape => "path-escape",
        }
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal pipeline error, covering every non-terminal-`Rejected` failure mode a job can take
/// after admission. Each maps to exactly one `ExitReason` via `classify`, used once at the C4/C1
/// boundary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A validation failure discovered mid-pipeline (path escape is only detectable once file
    /// transfer actually walks the paths).
    #[error("rejected: {0}")]
    Rejected(RejectionKind),
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(#[source] sandbox::SandboxError),
    #[error("file transfer failed: {0}")]
    FileTransferFailed(#[source] sandbox::SandboxError),
    #[error("wall-clock deadline exceeded")]
    DeadlineExceeded,
    #[error("cancelled")]
    Cancelled,
    #[error("program exited with signal (code {0})")]
    Crashed(i32),
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl PipelineError {
    /// Maps a pipeline-stage failure to the wire-level `exit.reason`. Callers needing the
    /// `Rejected` case should match it out themselves before calling `classify`; it is included
    /// here for completeness as "rejected requests don't have an exit reason" is itself a fact
    /// the type should not hide.
    pub fn classify(&self) -> ExitReason {
        match self {
            PipelineError::Rejected(_) => ExitReason::Unavailable,
            PipelineError::SandboxUnavailable(_) => ExitReason::Unavailable,
            PipelineError::FileTransferFailed(_) => ExitReason::Io,
            PipelineError::DeadlineExceeded => ExitReason::Timeout,
            PipelineError::Cancelled => ExitReason::Cancelled,
            PipelineError::Crashed(_) => ExitReason::Crashed,
            PipelineError::Infrastructure(_) => ExitReason::Unavailable,
        }
    }
}
