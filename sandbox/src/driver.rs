// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The sandbox runtime driver contract: what the core consumes from a container engine.
//! No specific product is assumed at this layer; `docker::DockerRuntime` and `fake::FakeRuntime`
//! are the two implementations the rest of the crate is built and tested against.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::future::BoxFuture;
use tokio::io::AsyncWrite;

use crate::error::SandboxError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(pub String);

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkId(pub String);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse resource bounds applied to a spawned sandbox. Per the non-goals, this is deliberately
/// not fine-grained CPU/memory accounting, just the limits a container engine accepts at create
/// time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub mem_mb: u64,
    pub cpu_share: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// One chunk of output read from a running exec, tagged by the stream it came from. Mirrors the
/// `ChildOutput` split used for local process execution elsewhere in this codebase, minus the
/// `Exit` variant: the exit code is delivered separately by `ExecHandle::waiter` so that callers
/// can select on output and exit independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutput {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// The live handles for one in-flight `exec` call.
pub struct ExecHandle {
    pub stdin: Box<dyn AsyncWrite + Unpin + Send>,
    pub output: BoxStream<'static, Result<ChildOutput, SandboxError>>,
    pub waiter: BoxFuture<'static, Result<i32, SandboxError>>,
}

/// The sandbox runtime driver contract. Every call is assumed fallible and may be slow;
/// implementations must not be called while a pool lock is held.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn network_create(&self) -> Result<NetworkId, SandboxError>;

    async fn network_destroy(&self, network: &NetworkId) -> Result<(), SandboxError>;

    /// Spawns a sandbox from `image` attached to `network`, blocking internally until the
    /// runtime's readiness probe passes. Callers enforce `spawn_timeout` externally via
    /// `tokio::time::timeout`.
    async fn spawn(
        &self,
        image: &str,
        network: &NetworkId,
        limits: &Limits,
    ) -> Result<SandboxId, SandboxError>;

    async fn copy(&self, sandbox: &SandboxId, path: &str, bytes: Bytes) -> Result<(), SandboxError>;

    async fn exec(
        &self,
        sandbox: &SandboxId,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecHandle, SandboxError>;

    async fn kill(&self, sandbox: &SandboxId, signal: Signal) -> Result<(), SandboxError>;

    async fn destroy(&self, sandbox: &SandboxId) -> Result<(), SandboxError>;
}
