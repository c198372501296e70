// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! End-to-end scenarios and boundary behaviors, driven against the in-memory fake
//! sandbox runtime so these never depend on a live container engine being present.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use config::{Config, Language};
use execution::{AdmissionQueue, ExecutionRequest, JobLimits, LanguageProfiles, Pipeline, Source};
use multiplex::{ExitReason, Frame, Multiplexer};
use sandbox::fake::FakeRuntime;
use sandbox::SandboxPool;
use telemetry::TelemetryRecorder;
use tokio_util::sync::CancellationToken;

type FakePool = SandboxPool<FakeRuntime>;

fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    config.default_deadline_ms = config::DurationMs(2_000);
    config.hard_deadline_ms = config::DurationMs(5_000);
    config.grace_ms = config::DurationMs(50);
    Arc::new(config)
}

struct Harness {
    pipeline: Arc<Pipeline<FakeRuntime>>,
    multiplexer: Arc<Multiplexer>,
    runtime: Arc<FakeRuntime>,
    pool: Arc<FakePool>,
    telemetry: TelemetryRecorder,
    config: Arc<Config>,
}

impl Harness {
    fn new(config: Arc<Config>) -> Self {
        let telemetry = TelemetryRecorder::new(100);
        let runtime = Arc::new(FakeRuntime::new());
        let pool = SandboxPool::new(runtime.clone(), telemetry.clone(), config.clone());
        let multiplexer = Arc::new(Multiplexer::new(telemetry.clone()));
        let admission = Arc::new(AdmissionQueue::new(config.max_concurrent, telemetry.clone()));
        let languages = Arc::new(LanguageProfiles::load(&config));
        let pipeline = Arc::new(Pipeline::new(
            admission,
            pool.clone(),
            multiplexer.clone(),
            telemetry.clone(),
            languages,
            config.clone(),
        ));
        Harness {
            pipeline,
            multiplexer,
            runtime,
            pool,
            telemetry,
            config,
        }
    }

    fn request(&self, session_id: &str, program: &str) -> ExecutionRequest {
        self.multiplexer
            .register_session(session_id, self.config.output_frame_buffer_per_session);
        ExecutionRequest {
            session_id: session_id.to_string(),
            language: Language::Python,
            files: vec![Source {
                path: "main.py".to_string(),
                content: Bytes::from(program.to_string()),
                entry: true,
            }],
            limits: JobLimits::default(),
        }
    }

    async fn collect_frames(&self, session_id: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.multiplexer.next_frame(session_id).await {
            let is_exit = frame.is_exit();
            frames.push(frame);
            if is_exit {
                break;
            }
        }
        frames
    }
}

#[tokio::test]
async fn scenario_python_hello() {
    let harness = Harness::new(test_config());
    let request = harness.request("s1", "ECHO hello");

    harness
        .pipeline
        .run_job(request, CancellationToken::new())
        .await;

    let frames = harness.collect_frames("s1").await;
    assert!(matches!(&frames[0], Frame::Stdout { data, .. } if data.as_ref() == b"hello\n"));
    assert!(matches!(&frames[1], Frame::Exit { code: 0, reason: ExitReason::Ok }));
}

#[tokio::test]
async fn scenario_reuse_flag_flips_on_second_run_of_same_language() {
    let harness = Harness::new(test_config());

    let first = harness.request("s1", "ECHO one");
    harness.pipeline.run_job(first, CancellationToken::new()).await;
    harness.collect_frames("s1").await;

    let second = harness.request("s1", "ECHO two");
    harness.pipeline.run_job(second, CancellationToken::new()).await;
    harness.collect_frames("s1").await;

    // Telemetry recorded one spawn (fresh) and one reuse across the two runs.
    let counters = harness.telemetry.snapshot().counters;
    assert_eq!(counters.get("sandbox_spawn_succeeded").copied().unwrap_or(0), 1);
    assert_eq!(counters.get("sandbox_reused").copied().unwrap_or(0), 1);
}

#[tokio::test]
async fn scenario_interactive_read() {
    let harness = Harness::new(test_config());
    let request = harness.request("s1", "READ_ECHO");

    let pipeline = harness.pipeline.clone();
    let multiplexer = harness.multiplexer.clone();
    let job = tokio::spawn(async move { pipeline.run_job(request, CancellationToken::new()).await });

    // Give the job a moment to reach the exec stage and open its stdin route.
    tokio::time::sleep(Duration::from_millis(20)).await;
    multiplexer.push_stdin("s1", Bytes::from_static(b"world\n")).await;

    job.await.unwrap();
    let frames = harness.collect_frames("s1").await;
    assert!(matches!(&frames[0], Frame::Stdout { data, .. } if data.as_ref() == b"world\n"));
    assert!(matches!(&frames[1], Frame::Exit { code: 0, reason: ExitReason::Ok }));
}

#[tokio::test]
async fn scenario_deadline_exceeded() {
    let mut config = Config::default();
    config.default_deadline_ms = config::DurationMs(100);
    config.hard_deadline_ms = config::DurationMs(500);
    config.grace_ms = config::DurationMs(50);
    let harness = Harness::new(Arc::new(config));
    let request = harness.request("s1", "SLEEP 5000");

    let outcome = harness.pipeline.run_job(request, CancellationToken::new()).await;
    assert_eq!(outcome.reason, ExitReason::Timeout);

    let frames = harness.collect_frames("s1").await;
    assert!(frames.iter().any(|f| matches!(f, Frame::System { message, .. } if message == "deadline exceeded")));
    assert!(matches!(frames.last().unwrap(), Frame::Exit { reason: ExitReason::Timeout, .. }));
}

#[tokio::test]
async fn scenario_cancel_mid_run() {
    let harness = Harness::new(test_config());
    let request = harness.request("s1", "SLEEP 10000");
    let cancel = CancellationToken::new();

    let pipeline = harness.pipeline.clone();
    let cancel_for_job = cancel.clone();
    let job = tokio::spawn(async move { pipeline.run_job(request, cancel_for_job).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let outcome = job.await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Cancelled);
    // I5: a cancelled job's lease is still released (unhealthy, so the sandbox is destroyed
    // rather than recycled) once `run_job` returns.
    assert_eq!(harness.pool.total_sandboxes(), 0);
}

#[tokio::test]
async fn scenario_queue_fairness_with_max_concurrent_one() {
    let mut config = Config::default();
    config.max_concurrent = 1;
    let harness = Harness::new(Arc::new(config));

    let a = harness.request("a", "SLEEP 10000");
    let cancel_a = CancellationToken::new();
    let pipeline = harness.pipeline.clone();
    let cancel_a_job = cancel_a.clone();
    let job_a = tokio::spawn(async move { pipeline.run_job(a, cancel_a_job).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let b = harness.request("b", "ECHO fast");
    let pipeline = harness.pipeline.clone();
    let job_b = tokio::spawn(async move { pipeline.run_job(b, CancellationToken::new()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!job_b.is_finished(), "B must wait behind A while maxConcurrent=1");

    cancel_a.cancel();
    job_a.await.unwrap();
    job_b.await.unwrap();

    let frames = harness.collect_frames("b").await;
    assert!(matches!(&frames[0], Frame::Stdout { data, .. } if data.as_ref() == b"fast\n"));
}

#[tokio::test]
async fn scenario_max_concurrent_zero_rejects_immediately() {
    let mut config = Config::default();
    config.max_concurrent = 0;
    let harness = Harness::new(Arc::new(config));
    let request = harness.request("s1", "ECHO hi");

    let outcome = harness.pipeline.run_job(request, CancellationToken::new()).await;
    assert_eq!(outcome.reason, ExitReason::Unavailable);
}

#[tokio::test]
async fn scenario_spawn_fails_then_succeeds() {
    let harness = Harness::new(test_config());
    harness.runtime.fail_next_spawns(1);
    let request = harness.request("s1", "ECHO hello");

    let outcome = harness.pipeline.run_job(request, CancellationToken::new()).await;
    assert_eq!(outcome.reason, ExitReason::Unavailable);

    let second = harness.request("s1", "ECHO hello");
    let outcome = harness.pipeline.run_job(second, CancellationToken::new()).await;
    assert_eq!(outcome.reason, ExitReason::Ok);

    let counters = harness.telemetry.snapshot().counters;
    assert_eq!(counters.get("sandbox_spawn_failed").copied().unwrap_or(0), 1);
    assert_eq!(counters.get("sandbox_spawn_succeeded").copied().unwrap_or(0), 1);
}

#[tokio::test]
async fn boundary_zero_source_request_is_rejected() {
    let files: Vec<Source> = Vec::new();
    let err = execution::validate_files(&files, 1024).unwrap_err();
    assert_eq!(err, execution::RejectionKind::NoEntrypoint);
}

#[tokio::test]
async fn boundary_path_escape_is_caught_during_file_transfer() {
    let harness = Harness::new(test_config());
    harness
        .multiplexer
        .register_session("s1", harness.config.output_frame_buffer_per_session);
    let request = ExecutionRequest {
        session_id: "s1".to_string(),
        language: Language::Python,
        files: vec![Source {
            path: "../escape.py".to_string(),
            content: Bytes::from_static(b"ECHO hi"),
            entry: true,
        }],
        limits: JobLimits::default(),
    };

    let outcome = harness.pipeline.run_job(request, CancellationToken::new()).await;
    assert_eq!(outcome.reason, ExitReason::Unavailable);
}
