// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Process entry point: load configuration, install the ring-buffered logger, build an owned
//! `Executor`, and run the session gateway and administrator HTTP surface until the process
//! receives SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use config::Config;
use sandbox::docker::DockerRuntime;
use server::Service;
use task_executor::Executor;
use tokio::net::TcpListener;

fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("failed to load configuration: {e}");
        std::process::exit(1);
    });
    let config = Arc::new(config);

    let log_ring = server::RingLogger::install(config.log_ring_capacity)
        .unwrap_or_else(|e| panic!("failed to install logger: {e}"));

    let worker_threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let executor = Executor::new_owned(worker_threads, worker_threads + 4, || {})
        .unwrap_or_else(|e| panic!("failed to start tokio runtime: {e}"));

    let result = executor.block_on(run(config, executor.clone(), log_ring));
    executor.shutdown(std::time::Duration::from_secs(10));
    if let Err(e) = result {
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Arc<Config>, executor: Executor, log_ring: server::LogRing) -> Result<(), std::io::Error> {
    let runtime = Arc::new(DockerRuntime::connect().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("failed to connect to container runtime: {e}"),
        )
    })?);

    let mut service = Service::new(config.clone(), executor.clone(), runtime, log_ring);
    service.run().await?;

    let admin_listener = TcpListener::bind(&config.admin_bind_addr).await?;
    log::info!("admin surface listening on {}", admin_listener.local_addr()?);
    let admin_router = service.admin_router();
    let admin_handle = executor.native_spawn(server::admin::serve(admin_listener, admin_router));

    tokio::signal::ctrl_c().await?;
    log::info!("received shutdown signal, draining in-flight sessions");

    service.shutdown().await;
    admin_handle.abort();
    Ok(())
}
