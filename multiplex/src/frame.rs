// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;

/// One discrete message on the session transport, flowing server→client. The gateway translates
/// these into the server's JSON envelopes; this crate never serializes them itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Stdout { data: Bytes, ts_ms: u64 },
    Stderr { data: Bytes, ts_ms: u64 },
    System { message: String, ts_ms: u64 },
    /// Always the final frame of a job; no output frame may follow it.
    Exit { code: i32, reason: ExitReason },
}

impl Frame {
    pub(crate) fn is_droppable(&self) -> bool {
        matches!(self, Frame::Stdout { .. } | Frame::Stderr { .. })
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Frame::Exit { .. })
    }
}

/// The closed set of `exit.reason` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Ok,
    Crashed,
    Unavailable,
    Io,
    Timeout,
    Cancelled,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Ok => "ok",
            ExitReason::Crashed => "crash",
            ExitReason::Unavailable => "unavailable",
            ExitReason::Io => "io",
            ExitReason::Timeout => "timeout",
            ExitReason::Cancelled => "cancelled",
        }
    }
}
