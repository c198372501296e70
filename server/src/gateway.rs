// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Session Gateway (C1): one WebSocket per session, minted on TCP accept. Each connection is
//! split into a read half (driven on the connection task itself) and a write half (owned
//! exclusively by a dedicated forwarding task draining the multiplexer). The accept loop is a
//! bound `TcpListener` raced against an oneshot shutdown signal via `future::select`, with an
//! `RwLock` that proves every in-flight connection has finished before `shutdown` returns.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use config::{Config, Language};
use execution::{validate_files, Pipeline, RejectionKind};
use futures::future::{self, FutureExt};
use futures::{SinkExt, StreamExt};
use multiplex::{Frame, Multiplexer, StdinOutcome};
use parking_lot::Mutex as SyncMutex;
use sandbox::SandboxRuntime;
use task_executor::Executor;
use telemetry::{Counter, TelemetryRecorder};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::wire::{self, InboundMessage, OutboundMessage, WireLimits, WireSource};

struct GatewayState<R: SandboxRuntime> {
    pipeline: Arc<Pipeline<R>>,
    multiplexer: Arc<Multiplexer>,
    telemetry: TelemetryRecorder,
    config: Arc<Config>,
}

/// One `run` in flight for a session. Holding both the cancellation token and the join handle
/// lets `cancel` and transport-loss cleanup both reach the same job.
struct RunningJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A background accept loop plus a handle the owner can use to stop it and wait for every
/// connection to drain.
pub struct GatewayServer {
    exit_sender: oneshot::Sender<()>,
    exited_receiver: oneshot::Receiver<()>,
    local_addr: SocketAddr,
}

impl GatewayServer {
    pub async fn bind<R: SandboxRuntime + 'static>(
        executor: &Executor,
        bind_addr: &str,
        pipeline: Arc<Pipeline<R>>,
        multiplexer: Arc<Multiplexer>,
        telemetry: TelemetryRecorder,
        config: Arc<Config>,
    ) -> Result<GatewayServer, std::io::Error> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(GatewayState {
            pipeline,
            multiplexer,
            telemetry,
            config,
        });

        let (exit_sender, exit_receiver) = oneshot::channel();
        let (exited_sender, exited_receiver) = oneshot::channel();
        executor.native_spawn(Self::accept_loop(
            executor.clone(),
            state,
            listener,
            exit_receiver,
            exited_sender,
        ));

        Ok(GatewayServer {
            exit_sender,
            exited_receiver,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections and waits for every in-flight connection's read loop,
    /// forwarding task, and (if any) running job to finish.
    pub async fn shutdown(self) {
        let _ = self.exit_sender.send(());
        let _ = self.exited_receiver.await;
    }

    async fn accept_loop<R: SandboxRuntime + 'static>(
        executor: Executor,
        state: Arc<GatewayState<R>>,
        listener: TcpListener,
        mut should_exit: oneshot::Receiver<()>,
        exited: oneshot::Sender<()>,
    ) {
        let ongoing_connections = Arc::new(RwLock::new(()));

        loop {
            let accepted = match future::select(listener.accept().boxed(), should_exit).await {
                future::Either::Left((Ok((stream, _addr)), s_e)) => {
                    should_exit = s_e;
                    stream
                }
                future::Either::Left((Err(e), s_e)) => {
                    log::warn!("gateway accept failed: {e}");
                    should_exit = s_e;
                    continue;
                }
                future::Either::Right(_) => break,
            };

            let connection_started = Arc::new(Notify::new());
            let state = state.clone();
            let ongoing_connections = ongoing_connections.clone();
            let connection_started_for_task = connection_started.clone();
            executor.native_spawn(async move {
                let guard = ongoing_connections.read().await;
                connection_started_for_task.notify_one();
                handle_connection(accepted, state).await;
                drop(guard);
            });
            connection_started.notified().await;
        }

        let _ = ongoing_connections.write().await;
        let _ = exited.send(());
    }
}

async fn handle_connection<R: SandboxRuntime + 'static>(stream: TcpStream, state: Arc<GatewayState<R>>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("websocket upgrade failed: {e}");
            return;
        }
    };

    let session_id = Uuid::new_v4().to_string();
    state
        .multiplexer
        .register_session(&session_id, state.config.output_frame_buffer_per_session);
    state.telemetry.inc_active_clients();
    state.telemetry.increment_counter(Counter::SessionsConnected, 1);

    let (mut sink, mut stream_half) = ws.split();
    let (direct_tx, mut direct_rx) = mpsc::channel::<OutboundMessage>(16);
    let running: Arc<SyncMutex<Option<RunningJob>>> = Arc::new(SyncMutex::new(None));

    let forwarding = {
        let multiplexer = state.multiplexer.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            let mut direct_open = true;
            loop {
                tokio::select! {
                    biased;
                    frame = multiplexer.next_frame(&session_id) => {
                        match frame {
                            Some(frame) => {
                                if send_json(&mut sink, &OutboundMessage::from(frame)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    direct = direct_rx.recv(), if direct_open => {
                        match direct {
                            Some(msg) => {
                                if send_json(&mut sink, &msg).await.is_err() {
                                    break;
                                }
                            }
                            None => direct_open = false,
                        }
                    }
                }
            }
            let _ = sink.close().await;
        })
    };

    while let Some(message) = stream_half.next().await {
        let message = match message {
            Ok(m) => m,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => {
                handle_inbound(&state, &session_id, &running, &direct_tx, &text).await;
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    // Transport loss cascades into a cancel of any job still running.
    let abandoned = running.lock().take();
    if let Some(job) = abandoned {
        job.cancel.cancel();
        let _ = job.handle.await;
    }
    state.multiplexer.deregister_session(&session_id);
    state.telemetry.dec_active_clients();
    state.telemetry.increment_counter(Counter::SessionsDisconnected, 1);
    drop(direct_tx);
    let _ = forwarding.await;
}

async fn handle_inbound<R: SandboxRuntime + 'static>(
    state: &Arc<GatewayState<R>>,
    session_id: &str,
    running: &Arc<SyncMutex<Option<RunningJob>>>,
    direct_tx: &mpsc::Sender<OutboundMessage>,
    text: &str,
) {
    let command: InboundMessage = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("malformed command on session {session_id}: {e}");
            return;
        }
    };

    match command {
        InboundMessage::Run { language, files, limits } => {
            handle_run(state, session_id, running, direct_tx, language, files, limits).await;
        }
        InboundMessage::Stdin { data } => {
            let outcome = state
                .multiplexer
                .push_stdin(session_id, Bytes::from(data.into_bytes()))
                .await;
            let warning = match outcome {
                StdinOutcome::Delivered => None,
                StdinOutcome::NoJobRunning => Some("no program is running"),
                StdinOutcome::StdinClosed => Some("stdin closed"),
            };
            if let Some(message) = warning {
                state.multiplexer.push_output(
                    session_id,
                    Frame::System {
                        message: message.to_string(),
                        ts_ms: now_ms(),
                    },
                );
            }
        }
        InboundMessage::Cancel {} => {
            if let Some(job) = running.lock().as_ref() {
                job.cancel.cancel();
            }
        }
    }
}

async fn handle_run<R: SandboxRuntime + 'static>(
    state: &Arc<GatewayState<R>>,
    session_id: &str,
    running: &Arc<SyncMutex<Option<RunningJob>>>,
    direct_tx: &mpsc::Sender<OutboundMessage>,
    language: String,
    files: Vec<WireSource>,
    limits: WireLimits,
) {
    if running.lock().is_some() {
        let _ = direct_tx
            .send(OutboundMessage::rejected(RejectionKind::Busy, "a job is already running on this session"))
            .await;
        return;
    }

    let language = match Language::parse(&language) {
        Some(l) => l,
        None => {
            let _ = direct_tx
                .send(OutboundMessage::rejected(
                    RejectionKind::UnknownLanguage,
                    format!("unknown language: {language}"),
                ))
                .await;
            return;
        }
    };

    let request = wire::build_request(session_id.to_string(), language, files, limits);
    if let Err(kind) = validate_files(&request.files, state.config.per_job_source_byte_cap) {
        let _ = direct_tx.send(OutboundMessage::rejected(kind, kind.to_string())).await;
        return;
    }

    let cancel = CancellationToken::new();
    let pipeline = state.pipeline.clone();
    let cancel_for_job = cancel.clone();
    let running_for_job = running.clone();
    let handle = tokio::spawn(async move {
        pipeline.run_job(request, cancel_for_job).await;
        running_for_job.lock().take();
    });
    *running.lock() = Some(RunningJob { cancel, handle });
}

async fn send_json<S>(sink: &mut S, message: &OutboundMessage) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
