// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An in-memory `SandboxRuntime` with no real container engine behind it, used by every
//! pipeline-level test so that CI never depends on a live Docker daemon. Entrypoint "programs"
//! are a tiny line-oriented script understood by `run_program` below rather than real source
//! code — the pipeline under test neither knows nor cares.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};

use crate::driver::{ChildOutput, ExecHandle, Limits, NetworkId, SandboxId, SandboxRuntime, Signal};
use crate::error::SandboxError;

struct FakeSandbox {
    files: HashMap<String, Bytes>,
    killed: Arc<Notify>,
}

pub struct FakeRuntime {
    sandboxes: Mutex<HashMap<SandboxId, FakeSandbox>>,
    next_id: AtomicU64,
    spawn_failures_remaining: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        FakeRuntime {
            sandboxes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            spawn_failures_remaining: AtomicUsize::new(0),
        }
    }

    /// The next `n` calls to `spawn` fail before spawning starts succeeding again; grounds the
    /// boundary scenario "spawn fails on first attempt, succeeds on second".
    pub fn fail_next_spawns(&self, n: usize) {
        self.spawn_failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn file_count(&self, sandbox: &SandboxId) -> usize {
        self.sandboxes
            .lock()
            .get(sandbox)
            .map(|s| s.files.len())
            .unwrap_or(0)
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn network_create(&self) -> Result<NetworkId, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(NetworkId(format!("fake-net-{id}")))
    }

    async fn network_destroy(&self, _network: &NetworkId) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn spawn(
        &self,
        image: &str,
        _network: &NetworkId,
        _limits: &Limits,
    ) -> Result<SandboxId, SandboxError> {
        let remaining = self.spawn_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.spawn_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(SandboxError::Spawn {
                image: image.to_string(),
                reason: "fake: scripted spawn failure".to_string(),
            });
        }
        let id = SandboxId(format!("fake-sandbox-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        self.sandboxes.lock().insert(
            id.clone(),
            FakeSandbox {
                files: HashMap::new(),
                killed: Arc::new(Notify::new()),
            },
        );
        Ok(id)
    }

    async fn copy(&self, sandbox: &SandboxId, path: &str, bytes: Bytes) -> Result<(), SandboxError> {
        let mut sandboxes = self.sandboxes.lock();
        let entry = sandboxes
            .get_mut(sandbox)
            .ok_or_else(|| SandboxError::Copy {
                sandbox_id: sandbox.to_string(),
                path: path.to_string(),
                reason: "unknown sandbox".to_string(),
            })?;
        entry.files.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn exec(
        &self,
        sandbox: &SandboxId,
        command: &[String],
        _env: &HashMap<String, String>,
    ) -> Result<ExecHandle, SandboxError> {
        let (program, killed) = {
            let sandboxes = self.sandboxes.lock();
            let entry = sandboxes.get(sandbox).ok_or_else(|| SandboxError::Exec {
                sandbox_id: sandbox.to_string(),
                reason: "unknown sandbox".to_string(),
            })?;
            let entry_path = command.last().cloned().unwrap_or_default();
            let program = entry
                .files
                .get(&entry_path)
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            (program, entry.killed.clone())
        };

        let (output_tx, output_rx) = mpsc::channel::<Result<ChildOutput, SandboxError>>(64);
        let (stdin_writer, stdin_reader) = tokio::io::duplex(4096);
        let sandbox_id = sandbox.clone();

        let waiter = Box::pin(run_program(program, stdin_reader, output_tx, killed, sandbox_id));

        Ok(ExecHandle {
            stdin: Box::new(stdin_writer),
            output: tokio_stream::wrappers::ReceiverStream::new(output_rx).boxed(),
            waiter,
        })
    }

    async fn kill(&self, sandbox: &SandboxId, _signal: Signal) -> Result<(), SandboxError> {
        if let Some(entry) = self.sandboxes.lock().get(sandbox) {
            entry.killed.notify_waiters();
        }
        Ok(())
    }

    async fn destroy(&self, sandbox: &SandboxId) -> Result<(), SandboxError> {
        self.sandboxes.lock().remove(sandbox);
        Ok(())
    }
}

/// Interprets the tiny fake-program DSL. One line commands:
///   `ECHO <text>`    — write `<text>\n` to stdout, exit 0.
///   `READ_ECHO`      — read one line from stdin, echo it to stdout, exit 0.
///   `SLEEP <ms>`     — sleep, then write "done\n" to stdout, exit 0.
///   `HANG`           — loop until killed, then exit 137.
///   `CRASH`          — exit 1 immediately, no output.
///   anything else    — echo the program text verbatim, exit 0.
async fn run_program(
    program: String,
    stdin_reader: impl tokio::io::AsyncRead + Unpin,
    output_tx: mpsc::Sender<Result<ChildOutput, SandboxError>>,
    killed: Arc<Notify>,
    sandbox_id: SandboxId,
) -> Result<i32, SandboxError> {
    let program = program.trim();

    if let Some(text) = program.strip_prefix("ECHO ") {
        let _ = output_tx
            .send(Ok(ChildOutput::Stdout(Bytes::from(format!("{text}\n")))))
            .await;
        return Ok(0);
    }

    if program == "READ_ECHO" {
        let mut reader = BufReader::new(stdin_reader);
        let mut line = String::new();
        tokio::select! {
            _ = killed.notified() => return Ok(137),
            res = reader.read_line(&mut line) => {
                res.map_err(|e| SandboxError::Io(sandbox_id.to_string(), e.to_string()))?;
            }
        }
        let _ = output_tx.send(Ok(ChildOutput::Stdout(Bytes::from(line)))).await;
        return Ok(0);
    }

    if let Some(ms) = program.strip_prefix("SLEEP ") {
        let millis: u64 = ms.trim().parse().unwrap_or(0);
        tokio::select! {
            _ = killed.notified() => return Ok(137),
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
        }
        let _ = output_tx
            .send(Ok(ChildOutput::Stdout(Bytes::from_static(b"done\n"))))
            .await;
        return Ok(0);
    }

    if program == "HANG" {
        killed.notified().await;
        return Ok(137);
    }

    if program == "CRASH" {
        return Ok(1);
    }

    let _ = output_tx
        .send(Ok(ChildOutput::Stdout(Bytes::from(format!("{program}\n")))))
        .await;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Limits;
    use futures::StreamExt;

    #[tokio::test]
    async fn echo_program_produces_expected_stdout() {
        let runtime = FakeRuntime::new();
        let network = runtime.network_create().await.unwrap();
        let sandbox = runtime.spawn("image", &network, &Limits::default()).await.unwrap();
        runtime
            .copy(&sandbox, "main.py", Bytes::from_static(b"ECHO hello"))
            .await
            .unwrap();
        let mut handle = runtime
            .exec(&sandbox, &["fake".to_string(), "main.py".to_string()], &HashMap::new())
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = handle.output.next().await {
            if let ChildOutput::Stdout(bytes) = chunk.unwrap() {
                out.extend_from_slice(&bytes);
            }
        }
        let code = handle.waiter.await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, b"hello\n");
    }

    #[tokio::test]
    async fn spawn_can_be_scripted_to_fail_then_succeed() {
        let runtime = FakeRuntime::new();
        runtime.fail_next_spawns(1);
        let network = runtime.network_create().await.unwrap();
        assert!(runtime.spawn("image", &network, &Limits::default()).await.is_err());
        assert!(runtime.spawn("image", &network, &Limits::default()).await.is_ok());
    }

    #[tokio::test]
    async fn hang_program_exits_only_after_kill() {
        let runtime = FakeRuntime::new();
        let network = runtime.network_create().await.unwrap();
        let sandbox = runtime.spawn("image", &network, &Limits::default()).await.unwrap();
        runtime
            .copy(&sandbox, "main.py", Bytes::from_static(b"HANG"))
            .await
            .unwrap();
        let handle = runtime
            .exec(&sandbox, &["fake".to_string(), "main.py".to_string()], &HashMap::new())
            .await
            .unwrap();
        let sandbox_for_kill = sandbox.clone();
        let runtime = Arc::new(runtime);
        let runtime2 = runtime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            runtime2.kill(&sandbox_for_kill, Signal::Kill).await.unwrap();
        });
        let code = handle.waiter.await.unwrap();
        assert_eq!(code, 137);
    }
}
