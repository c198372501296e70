// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The pipeline telemetry recorder (C6): a thread-safe in-memory store of rolling counters,
//! per-stage latency reservoirs, daily rollups, and a bounded slow-execution ring. Nothing here
//! ever blocks a caller on I/O; archival of completed days to disk is the server crate's job,
//! driven by `TelemetryRecorder::take_completed_days`.

pub mod metrics;
pub mod recorder;
pub mod rollup;

pub use metrics::{Counter, Stage};
pub use recorder::{job_record, PipelineMetricsSnapshot, Snapshot, StagePercentiles};
pub use rollup::{DailyMetrics, JobRecord, LatencySummary, Outcome};

pub use recorder::TelemetryRecorder;
