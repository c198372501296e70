// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::frame::Frame;

/// The minimum interval between "output truncated" notices: at most one per second of
/// sustained backpressure, however many frames are dropped within that window.
const NOTICE_INTERVAL: Duration = Duration::from_secs(1);

/// A session's bounded, SPSC-equivalent outbound buffer: the multiplexer is the sole writer, the
/// gateway's forwarding task is the sole reader. Full-buffer behavior is drop-oldest-then-notice:
/// the oldest stdout/stderr frame is discarded to make room; `System`/`Exit` frames are never
/// dropped.
pub(crate) struct OutboundQueue {
    buffer: Mutex<VecDeque<Frame>>,
    notify: Notify,
    cap: usize,
    dropped_total: AtomicU64,
    dropped_since_notice: AtomicU64,
    last_notice_at: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub(crate) fn new(cap: usize) -> Self {
        OutboundQueue {
            buffer: Mutex::new(VecDeque::with_capacity(cap.min(256))),
            notify: Notify::new(),
            cap,
            dropped_total: AtomicU64::new(0),
            dropped_since_notice: AtomicU64::new(0),
            last_notice_at: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Pushes `frame`, evicting the oldest droppable frame first if at capacity. Returns a
    /// pending notice message if one should now be emitted (the caller pushes it as a follow-up
    /// `System` frame so accounting in tests stays simple: one push call, one buffer mutation).
    pub(crate) fn push(&self, frame: Frame) -> Option<String> {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.cap {
                if let Some(pos) = buffer.iter().position(Frame::is_droppable) {
                    buffer.remove(pos);
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    self.dropped_since_notice.fetch_add(1, Ordering::Relaxed);
                } else {
                    log::warn!("outbound queue at capacity with no droppable frame to evict");
                }
            }
            buffer.push_back(frame);
        }
        self.notify.notify_one();
        self.maybe_build_notice()
    }

    fn maybe_build_notice(&self) -> Option<String> {
        let pending = self.dropped_since_notice.load(Ordering::Relaxed);
        if pending == 0 {
            return None;
        }
        let mut last_notice = self.last_notice_at.lock();
        let now = Instant::now();
        let due = last_notice.map(|at| now.duration_since(at) >= NOTICE_INTERVAL).unwrap_or(true);
        if !due {
            return None;
        }
        *last_notice = Some(now);
        let count = self.dropped_since_notice.swap(0, Ordering::Relaxed);
        Some(format!("output truncated: {count} frames dropped"))
    }

    /// Pushes a session's terminal frame (`Exit`), first force-flushing any pending drop count
    /// as a notice regardless of the throttle window. Both the eviction this push may itself
    /// need to make room and the notice go out under the same buffer lock, immediately ahead of
    /// the terminal frame, so the reported notice counts always sum to the true total and the
    /// terminal frame is still the last thing in the buffer. Returns `true` if a notice frame
    /// was enqueued.
    pub(crate) fn push_terminal(&self, notice_ts_ms: u64, frame: Frame) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.cap {
            if let Some(pos) = buffer.iter().position(Frame::is_droppable) {
                buffer.remove(pos);
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                self.dropped_since_notice.fetch_add(1, Ordering::Relaxed);
            } else {
                log::warn!("outbound queue at capacity with no droppable frame to evict");
            }
        }
        let count = self.dropped_since_notice.swap(0, Ordering::Relaxed);
        let emitted = count > 0;
        if emitted {
            *self.last_notice_at.lock() = Some(Instant::now());
            buffer.push_back(Frame::System {
                message: format!("output truncated: {count} frames dropped"),
                ts_ms: notice_ts_ms,
            });
        }
        buffer.push_back(frame);
        drop(buffer);
        self.notify.notify_one();
        emitted
    }

    pub(crate) fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Waits for and removes the next frame, or returns `None` once the session has been closed
    /// and drained.
    pub(crate) async fn next(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.buffer.lock().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn stdout(n: u8) -> Frame {
        Frame::Stdout {
            data: Bytes::from(vec![n]),
            ts_ms: n as u64,
        }
    }

    #[test]
    fn drops_oldest_stdout_when_full() {
        let queue = OutboundQueue::new(2);
        assert!(queue.push(stdout(1)).is_none());
        assert!(queue.push(stdout(2)).is_none());
        // Third push evicts frame 1.
        queue.push(stdout(3));
        assert_eq!(queue.dropped_total(), 1);
    }

    #[test]
    fn exit_and_system_frames_are_never_evicted() {
        let queue = OutboundQueue::new(1);
        queue.push(Frame::Exit {
            code: 0,
            reason: crate::frame::ExitReason::Ok,
        });
        // Buffer already at capacity with a non-droppable frame; pushing more just grows it
        // rather than evicting the Exit frame.
        queue.push(stdout(1));
        assert_eq!(queue.dropped_total(), 0);
    }

    #[tokio::test]
    async fn next_blocks_until_pushed_then_drains_in_order() {
        let queue = OutboundQueue::new(10);
        queue.push(stdout(1));
        queue.push(stdout(2));
        assert_eq!(queue.next().await, Some(stdout(1)));
        assert_eq!(queue.next().await, Some(stdout(2)));
    }

    #[tokio::test]
    async fn push_terminal_flushes_a_partial_window_ahead_of_the_terminal_frame() {
        let queue = OutboundQueue::new(2);
        queue.push(stdout(1));
        queue.push(stdout(2));
        // Evicts frame 1; the throttle window is immediately due (no prior notice), so this
        // drop is flushed right away and the window opens.
        queue.push(stdout(3));
        // Evicts frame 2, now within the just-opened window: this drop has nowhere to go until
        // the window closes or something force-flushes it.
        queue.push(stdout(4));
        assert_eq!(queue.dropped_total(), 2);

        let emitted = queue.push_terminal(
            99,
            Frame::Exit {
                code: 0,
                reason: crate::frame::ExitReason::Ok,
            },
        );
        assert!(emitted, "the drop from the second eviction must not be left stranded");

        // Both the eviction `push_terminal` itself needed (to make room for the terminal frame)
        // and the still-pending one land as a single notice immediately before the terminal
        // frame, never after it.
        assert_eq!(queue.next().await, Some(stdout(4)));
        let notice = queue.next().await.unwrap();
        assert!(
            matches!(&notice, Frame::System { message, .. } if message == "output truncated: 2 frames dropped")
        );
        let terminal = queue.next().await.unwrap();
        assert!(terminal.is_exit());
    }

    #[tokio::test]
    async fn push_terminal_is_a_no_op_notice_when_nothing_was_dropped() {
        let queue = OutboundQueue::new(10);
        queue.push(stdout(1));
        let emitted = queue.push_terminal(
            0,
            Frame::Exit {
                code: 0,
                reason: crate::frame::ExitReason::Ok,
            },
        );
        assert!(!emitted);
        assert_eq!(queue.next().await, Some(stdout(1)));
        assert!(queue.next().await.unwrap().is_exit());
    }

    #[tokio::test]
    async fn next_returns_none_after_close_and_drain() {
        let queue = OutboundQueue::new(10);
        queue.push(stdout(1));
        queue.close();
        assert_eq!(queue.next().await, Some(stdout(1)));
        assert_eq!(queue.next().await, None);
    }
}
