// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A `SandboxRuntime` backed by a Docker-compatible engine API via `bollard`. Each sandbox is a
//! long-lived container (entrypoint is a sleep loop) so that repeated `exec` calls against the
//! same sandbox are cheap; `spawn`/`destroy` pay the container create/remove cost once per
//! lease-miss rather than once per job.

use std::collections::HashMap;
use std::io::Write;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, KillContainerOptions,
    RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::network::{CreateNetworkOptions, RemoveNetworkOptions};
use bollard::service::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use futures::stream::StreamExt;

use crate::driver::{ChildOutput, ExecHandle, Limits, NetworkId, SandboxId, SandboxRuntime, Signal};
use crate::error::SandboxError;

/// Entrypoint kept alive long enough for an arbitrary number of `exec`s against it before the
/// pool decides to recycle or destroy the sandbox.
const KEEPALIVE_ENTRYPOINT: [&str; 3] = ["sleep", "infinity", ""];

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Spawn {
                image: "<connect>".to_string(),
                reason: e.to_string(),
            })?;
        Ok(DockerRuntime { docker })
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn network_create(&self) -> Result<NetworkId, SandboxError> {
        let name = format!("code-exec-{}", uuid::Uuid::new_v4());
        let response = self
            .docker
            .create_network(CreateNetworkOptions {
                name: name.as_str(),
                driver: "bridge",
                ..Default::default()
            })
            .await
            .map_err(|e| SandboxError::NetworkCreate(e.to_string()))?;
        Ok(NetworkId(response.id.unwrap_or(name)))
    }

    async fn network_destroy(&self, network: &NetworkId) -> Result<(), SandboxError> {
        self.docker
            .remove_network(&network.0, None::<RemoveNetworkOptions>)
            .await
            .map_err(|e| SandboxError::NetworkDestroy(network.to_string(), e.to_string()))
    }

    async fn spawn(
        &self,
        image: &str,
        network: &NetworkId,
        limits: &Limits,
    ) -> Result<SandboxId, SandboxError> {
        let name = format!("code-exec-sandbox-{}", uuid::Uuid::new_v4());
        let config = ContainerConfig {
            image: Some(image.to_string()),
            entrypoint: Some(
                KEEPALIVE_ENTRYPOINT
                    .iter()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect(),
            ),
            host_config: Some(HostConfig {
                network_mode: Some(network.0.clone()),
                memory: if limits.mem_mb > 0 {
                    Some((limits.mem_mb * 1024 * 1024) as i64)
                } else {
                    None
                },
                init: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Spawn {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        self.docker
            .start_container::<String>(&container.id, None)
            .await
            .map_err(|e| SandboxError::Spawn {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        // Readiness probe: a container that is running is ready to accept an exec call. No
        // in-container health-check protocol is assumed by the core.
        Ok(SandboxId(container.id))
    }

    async fn copy(&self, sandbox: &SandboxId, path: &str, bytes: Bytes) -> Result<(), SandboxError> {
        let mut archive = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive
            .append_data(&mut header, path, bytes.as_ref())
            .map_err(|e| SandboxError::Copy {
                sandbox_id: sandbox.to_string(),
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        let tar_bytes = archive.into_inner().map_err(|e| SandboxError::Copy {
            sandbox_id: sandbox.to_string(),
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        self.docker
            .upload_to_container(
                &sandbox.0,
                Some(UploadToContainerOptions {
                    path: "/",
                    ..Default::default()
                }),
                tar_bytes.into(),
            )
            .await
            .map_err(|e| SandboxError::Copy {
                sandbox_id: sandbox.to_string(),
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    async fn exec(
        &self,
        sandbox: &SandboxId,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecHandle, SandboxError> {
        let env: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let create = self
            .docker
            .create_exec(
                &sandbox.0,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    env: Some(env),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Exec {
                sandbox_id: sandbox.to_string(),
                reason: e.to_string(),
            })?;

        let exec_id = create.id;
        let start_result = self
            .docker
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Exec {
                sandbox_id: sandbox.to_string(),
                reason: e.to_string(),
            })?;

        let (input, output) = match start_result {
            StartExecResults::Attached { input, output } => (input, output),
            StartExecResults::Detached => {
                return Err(SandboxError::Exec {
                    sandbox_id: sandbox.to_string(),
                    reason: "docker exec unexpectedly detached".to_string(),
                })
            }
        };

        let output_stream = output
            .filter_map(|item| async move {
                match item {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        Some(Ok(ChildOutput::Stdout(message)))
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        Some(Ok(ChildOutput::Stderr(message)))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(SandboxError::Io(e.to_string(), String::new()))),
                }
            })
            .boxed();

        let docker = self.docker.clone();
        let exec_id_for_wait = exec_id.clone();
        let sandbox_for_wait = sandbox.clone();
        let waiter = Box::pin(async move {
            loop {
                let inspect = docker
                    .inspect_exec(&exec_id_for_wait)
                    .await
                    .map_err(|e| SandboxError::Exec {
                        sandbox_id: sandbox_for_wait.to_string(),
                        reason: e.to_string(),
                    })?;
                if inspect.running == Some(false) {
                    return Ok(inspect.exit_code.unwrap_or(-1) as i32);
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        });

        Ok(ExecHandle {
            stdin: Box::new(AsyncWriteAdapter(input)),
            output: output_stream,
            waiter,
        })
    }

    async fn kill(&self, sandbox: &SandboxId, signal: Signal) -> Result<(), SandboxError> {
        let signal_name = match signal {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
        };
        self.docker
            .kill_container(
                &sandbox.0,
                Some(KillContainerOptions {
                    signal: signal_name,
                }),
            )
            .await
            .map_err(|e| SandboxError::Kill(sandbox.to_string(), e.to_string()))
    }

    async fn destroy(&self, sandbox: &SandboxId) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                &sandbox.0,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Destroy(sandbox.to_string(), e.to_string()))
    }
}

/// `bollard`'s exec input handle implements plain `std::io::Write`/hyper upgrade semantics; this
/// adapts it to `tokio::io::AsyncWrite` so `ExecHandle::stdin` has one uniform type across the
/// Docker and fake drivers.
struct AsyncWriteAdapter<W>(W);

impl<W: Write + Unpin + Send> tokio::io::AsyncWrite for AsyncWriteAdapter<W> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        std::task::Poll::Ready(self.get_mut().0.write(buf))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(self.get_mut().0.flush())
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}
