// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Top-level wiring: owns every component (C1-C6) plus the background tasks that are not part of
//! any one job (the sandbox pool sweeper, the daily report rollover), and drives graceful
//! shutdown by stopping new work first, then draining what is already in flight within a bounded
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use config::Config;
use execution::{AdmissionQueue, LanguageProfiles, Pipeline};
use multiplex::Multiplexer;
use sandbox::SandboxRuntime;
use task_executor::{Executor, TailTasks};
use telemetry::TelemetryRecorder;

use crate::admin;
use crate::gateway::GatewayServer;
use crate::log_ring::LogRing;
use crate::reports;

/// How long `Service::shutdown` waits for tail tasks (sweeper, rollover) to notice cancellation
/// and exit before they are abandoned. Connection draining in the gateway has its own unbounded
/// wait, since an in-flight job must always reach its terminal `exit` frame (I5).
const TAIL_TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Service<R: SandboxRuntime + 'static> {
    config: Arc<Config>,
    executor: Executor,
    tail_tasks: TailTasks,
    telemetry: TelemetryRecorder,
    log_ring: LogRing,
    pool: Arc<sandbox::SandboxPool<R>>,
    multiplexer: Arc<Multiplexer>,
    pipeline: Arc<Pipeline<R>>,
    gateway: Option<GatewayServer>,
}

impl<R: SandboxRuntime + 'static> Service<R> {
    pub fn new(config: Arc<Config>, executor: Executor, runtime: Arc<R>, log_ring: LogRing) -> Self {
        let telemetry = TelemetryRecorder::new(200);
        let pool = sandbox::SandboxPool::new(runtime, telemetry.clone(), config.clone());
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

        Service {
            config,
            executor,
            tail_tasks: TailTasks::new(),
            telemetry,
            log_ring,
            pool,
            multiplexer,
            pipeline,
            gateway: None,
        }
    }

    /// Flushes any day the process never saw roll over (a restart mid-day should not lose
    /// yesterday's bucket), then starts the sweeper, the gateway, and the rollover loop.
    pub async fn run(&mut self) -> Result<(), std::io::Error> {
        reports::roll_over(&self.config.report_archive_dir, &self.telemetry).await;

        self.pool.spawn_sweeper(&self.executor);

        let gateway = GatewayServer::bind(
            &self.executor,
            &self.config.gateway_bind_addr,
            self.pipeline.clone(),
            self.multiplexer.clone(),
            self.telemetry.clone(),
            self.config.clone(),
        )
        .await?;
        log::info!("session gateway listening on {}", gateway.local_addr());
        self.gateway = Some(gateway);

        let report_dir = self.config.report_archive_dir.clone();
        let telemetry = self.telemetry.clone();
        self.tail_tasks.spawn_on(
            "report-rollover",
            self.executor.handle(),
            reports::rollover_loop(report_dir, telemetry, Duration::from_secs(3600)),
        );

        Ok(())
    }

    pub fn admin_router(&self) -> axum::Router {
        admin::router(self.telemetry.clone(), self.log_ring.clone(), self.config.clone())
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Stops accepting new sessions, waits for every in-flight connection (and the job it may be
    /// running) to reach its terminal state, then gives background tail tasks a bounded window to
    /// notice and exit before abandoning them.
    pub async fn shutdown(mut self) {
        if let Some(gateway) = self.gateway.take() {
            gateway.shutdown().await;
        }
        self.tail_tasks.wait(TAIL_TASK_SHUTDOWN_TIMEOUT).await;
    }
}
