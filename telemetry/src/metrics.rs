// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use strum_macros::EnumIter;

/// Rolling event counters maintained by the recorder. One entry per row of the counters table;
/// new counters are added here rather than as ad-hoc strings at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum Counter {
    AdmissionEnqueued,
    AdmissionGranted,
    AdmissionCancelled,
    AdmissionRejectedServiceUnavailable,
    SandboxSpawnAttempted,
    SandboxSpawnSucceeded,
    SandboxSpawnFailed,
    SandboxReused,
    SandboxEvicted,
    SandboxDestroyed,
    SessionsConnected,
    SessionsDisconnected,
    JobsCompletedOk,
    JobsCompletedCrashed,
    JobsTimedOut,
    JobsCancelled,
    JobsFailedInfrastructure,
    OutputFramesDropped,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::AdmissionEnqueued => "admission_enqueued",
            Counter::AdmissionGranted => "admission_granted",
            Counter::AdmissionCancelled => "admission_cancelled",
            Counter::AdmissionRejectedServiceUnavailable => {
                "admission_rejected_service_unavailable"
            }
            Counter::SandboxSpawnAttempted => "sandbox_spawn_attempted",
            Counter::SandboxSpawnSucceeded => "sandbox_spawn_succeeded",
            Counter::SandboxSpawnFailed => "sandbox_spawn_failed",
            Counter::SandboxReused => "sandbox_reused",
            Counter::SandboxEvicted => "sandbox_evicted",
            Counter::SandboxDestroyed => "sandbox_destroyed",
            Counter::SessionsConnected => "sessions_connected",
            Counter::SessionsDisconnected => "sessions_disconnected",
            Counter::JobsCompletedOk => "jobs_completed_ok",
            Counter::JobsCompletedCrashed => "jobs_completed_crashed",
            Counter::JobsTimedOut => "jobs_timed_out",
            Counter::JobsCancelled => "jobs_cancelled",
            Counter::JobsFailedInfrastructure => "jobs_failed_infrastructure",
            Counter::OutputFramesDropped => "output_frames_dropped",
        }
    }
}

/// A single named pipeline stage tracked in the per-stage timing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Queue,
    Network,
    Container,
    FileTransfer,
    Execution,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queue => "queue",
            Stage::Network => "network",
            Stage::Container => "container",
            Stage::FileTransfer => "file-transfer",
            Stage::Execution => "execution",
            Stage::Cleanup => "cleanup",
        }
    }
}
