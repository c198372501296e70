// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use telemetry::{Counter, TelemetryRecorder};
use tokio::sync::mpsc;

use crate::frame::{ExitReason, Frame};
use crate::outbound::OutboundQueue;

/// Fallback bound on a session's outbound buffer, in frames, used only by tests that don't care
/// about the configured value. Live sessions get their capacity from
/// `Config::output_frame_buffer_per_session`. Past this the multiplexer starts dropping the
/// oldest stdout/stderr frame per push.
#[cfg(test)]
const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Bound on the stdin channel feeding a running job. A slow-reading program applies backpressure
/// to the client write, which is the desired behavior for input (unlike output, input is never
/// dropped).
const STDIN_CHANNEL_CAPACITY: usize = 64;

/// Outcome of routing a `Stdin` frame to a session's running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinOutcome {
    /// Delivered to the program's stdin.
    Delivered,
    /// No program is currently running for this session.
    NoJobRunning,
    /// A program was running but its stdin channel has already been closed.
    StdinClosed,
}

struct SessionChannel {
    outbound: Arc<OutboundQueue>,
    stdin_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

/// The process-wide router: one outbound frame sink per connected session, and
/// one stdin sink per currently-running job. The gateway (C1) and the execution pipeline (C4)
/// never talk to each other directly; they only ever go through this table.
pub struct Multiplexer {
    sessions: Mutex<HashMap<String, Arc<SessionChannel>>>,
    telemetry: TelemetryRecorder,
}

impl Multiplexer {
    pub fn new(telemetry: TelemetryRecorder) -> Self {
        Multiplexer {
            sessions: Mutex::new(HashMap::new()),
            telemetry,
        }
    }

    /// Registers a freshly-accepted session with the given outbound buffer capacity (frames).
    /// Idempotent on a duplicate id would clobber state, so the gateway must guarantee session
    /// ids are unique (it mints them from a UUID).
    pub fn register_session(&self, session_id: &str, outbound_capacity: usize) {
        let channel = Arc::new(SessionChannel {
            outbound: Arc::new(OutboundQueue::new(outbound_capacity)),
            stdin_tx: Mutex::new(None),
        });
        self.sessions.lock().insert(session_id.to_string(), channel);
    }

    /// Tears down a session's table entry and wakes its forwarding task so it can exit.
    pub fn deregister_session(&self, session_id: &str) {
        if let Some(channel) = self.sessions.lock().remove(session_id) {
            channel.outbound.close();
        }
    }

    /// Opens the stdin route for a newly-started job, returning the receiving half for the
    /// pipeline's runner task to read from.
    pub fn open_job_input(&self, session_id: &str) -> Option<mpsc::Receiver<Bytes>> {
        let channel = self.sessions.lock().get(session_id)?.clone();
        let (tx, rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
        *channel.stdin_tx.lock() = Some(tx);
        Some(rx)
    }

    /// Drops the stdin route once a job finishes; stdin sent for a session with no running job
    /// is simply discarded.
    pub fn close_job_input(&self, session_id: &str) {
        if let Some(channel) = self.sessions.lock().get(session_id) {
            *channel.stdin_tx.lock() = None;
        }
    }

    /// Routes client-typed bytes to the currently running job's stdin, if any. Distinguishes why
    /// delivery failed so the gateway can send back the right warning frame: there is simply no
    /// job running for this session yet, or one was running but has since closed its stdin (the
    /// client raced the exit frame, or the program closed stdin early).
    pub async fn push_stdin(&self, session_id: &str, data: Bytes) -> StdinOutcome {
        let tx = {
            let sessions = self.sessions.lock();
            match sessions.get(session_id) {
                Some(channel) => channel.stdin_tx.lock().clone(),
                None => return StdinOutcome::NoJobRunning,
            }
        };
        match tx {
            Some(tx) => {
                if tx.send(data).await.is_ok() {
                    StdinOutcome::Delivered
                } else {
                    StdinOutcome::StdinClosed
                }
            }
            None => StdinOutcome::NoJobRunning,
        }
    }

    /// Appends output for `session_id`. No-op if the session has since disconnected (the job's
    /// runner task keeps calling this until it observes `Exit` was pushed).
    pub fn push_output(&self, session_id: &str, frame: Frame) {
        let is_exit = frame.is_exit();
        let channel = match self.sessions.lock().get(session_id) {
            Some(channel) => channel.clone(),
            None => return,
        };
        if is_exit {
            // The throttle window may still be open with a nonzero leftover count, and the
            // terminal frame's own push can itself evict one more: `push_terminal` flushes both
            // as a single notice immediately ahead of the terminal frame, so the notices'
            // reported counts always sum to the true total even though nothing can ever flush
            // a session after it goes terminal.
            if channel.outbound.push_terminal(now_ms(), frame) {
                self.telemetry.increment_counter(Counter::OutputFramesDropped, 1);
            }
            self.close_job_input(session_id);
            return;
        }
        if let Some(notice) = channel.outbound.push(frame) {
            self.telemetry.increment_counter(Counter::OutputFramesDropped, 1);
            let notice_frame = Frame::System {
                message: notice,
                ts_ms: now_ms(),
            };
            // The notice itself can never be dropped in turn: push it directly rather than
            // recursing through `push_output`, which would re-check for (and discard) an empty
            // follow-up notice.
            channel.outbound.push(notice_frame);
        }
    }

    /// Convenience for the pipeline to end a job's output with a terminal `Exit` frame.
    pub fn push_exit(&self, session_id: &str, code: i32, reason: ExitReason) {
        self.push_output(session_id, Frame::Exit { code, reason });
    }

    /// Awaits the next frame for a session, used by the gateway's per-connection forwarding task.
    /// Returns `None` once the session has been deregistered and its buffer drained.
    pub async fn next_frame(&self, session_id: &str) -> Option<Frame> {
        let outbound = self.sessions.lock().get(session_id).map(|c| c.outbound.clone())?;
        outbound.next().await
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry::TelemetryRecorder;

    fn recorder() -> TelemetryRecorder {
        TelemetryRecorder::new(16)
    }

    #[tokio::test]
    async fn output_round_trips_in_order() {
        let mux = Multiplexer::new(recorder());
        mux.register_session("s1", DEFAULT_OUTBOUND_CAPACITY);
        mux.push_output(
            "s1",
            Frame::Stdout {
                data: Bytes::from_static(b"hi"),
                ts_ms: 1,
            },
        );
        mux.push_exit("s1", 0, ExitReason::Ok);

        let first = mux.next_frame("s1").await.unwrap();
        assert!(matches!(first, Frame::Stdout { .. }));
        let second = mux.next_frame("s1").await.unwrap();
        assert!(second.is_exit());
    }

    #[tokio::test]
    async fn stdin_routes_to_open_job_only() {
        let mux = Multiplexer::new(recorder());
        mux.register_session("s1", DEFAULT_OUTBOUND_CAPACITY);
        assert_eq!(
            mux.push_stdin("s1", Bytes::from_static(b"x")).await,
            StdinOutcome::NoJobRunning
        );

        let mut rx = mux.open_job_input("s1").unwrap();
        assert_eq!(
            mux.push_stdin("s1", Bytes::from_static(b"hello")).await,
            StdinOutcome::Delivered
        );
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));

        mux.close_job_input("s1");
        assert_eq!(
            mux.push_stdin("s1", Bytes::from_static(b"late")).await,
            StdinOutcome::NoJobRunning
        );
    }

    #[tokio::test]
    async fn stdin_after_receiver_drop_reports_closed() {
        let mux = Multiplexer::new(recorder());
        mux.register_session("s1", DEFAULT_OUTBOUND_CAPACITY);
        let rx = mux.open_job_input("s1").unwrap();
        drop(rx);
        assert_eq!(
            mux.push_stdin("s1", Bytes::from_static(b"x")).await,
            StdinOutcome::StdinClosed
        );
    }

    #[tokio::test]
    async fn deregister_unblocks_pending_reader() {
        let mux = Arc::new(Multiplexer::new(recorder()));
        mux.register_session("s1", DEFAULT_OUTBOUND_CAPACITY);
        let reader = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.next_frame("s1").await })
        };
        tokio::task::yield_now().await;
        mux.deregister_session("s1");
        assert_eq!(reader.await.unwrap(), None);
    }

    #[tokio::test]
    async fn exit_flushes_a_leftover_drop_count_before_the_job_finishes() {
        // A tiny outbound buffer so pushes within the same throttle window evict frames, then
        // an Exit pushed immediately after: the leftover drop count must still reach the wire
        // as a final notice rather than being silently lost.
        let mux = Multiplexer::new(recorder());
        mux.register_session("s1", 1);
        for n in 0..5u8 {
            mux.push_output(
                "s1",
                Frame::Stdout {
                    data: Bytes::from(vec![n]),
                    ts_ms: n as u64,
                },
            );
        }
        mux.push_exit("s1", 0, ExitReason::Ok);

        let mut saw_notice = false;
        loop {
            match mux.next_frame("s1").await.unwrap() {
                Frame::System { .. } => saw_notice = true,
                frame if frame.is_exit() => break,
                _ => {}
            }
        }
        assert!(saw_notice, "leftover drops must be flushed before Exit");
    }

    #[tokio::test]
    async fn exit_frame_closes_job_input() {
        let mux = Multiplexer::new(recorder());
        mux.register_session("s1", DEFAULT_OUTBOUND_CAPACITY);
        let _rx = mux.open_job_input("s1").unwrap();
        mux.push_exit("s1", 1, ExitReason::Crashed);
        assert_eq!(
            mux.push_stdin("s1", Bytes::from_static(b"x")).await,
            StdinOutcome::NoJobRunning
        );
    }
}
