// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The JSON envelopes: client→server commands and server→client frames. This module owns the
//! wire shapes only; everything else in this crate talks in `execution`/`multiplex` types.

use bytes::Bytes;
use execution::{ExecutionRequest, JobLimits, RejectionKind, Source};
use multiplex::{ExitReason, Frame};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct WireSource {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub entry: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireLimits {
    #[serde(rename = "memMb")]
    pub mem_mb: Option<u64>,
    pub cpu: Option<f64>,
    #[serde(rename = "deadlineMs")]
    pub deadline_ms: Option<u64>,
}

impl From<WireLimits> for JobLimits {
    fn from(limits: WireLimits) -> Self {
        JobLimits {
            mem_mb: limits.mem_mb,
            cpu: limits.cpu,
            deadline_ms: limits.deadline_ms,
        }
    }
}

/// One client→server command. `language` and `files` are only present on `run`; serde's
/// externally-tagged enum derives that naturally from the `type` discriminant.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Run {
        language: String,
        files: Vec<WireSource>,
        #[serde(default)]
        limits: WireLimits,
    },
    Stdin {
        data: String,
    },
    Cancel {},
}

/// Builds the internal `ExecutionRequest` from a validated `run` command. Language parsing and
/// file-shape validation happen at the call site, where the session id and rejection-reply path
/// are both in scope.
pub fn build_request(
    session_id: String,
    language: config::Language,
    files: Vec<WireSource>,
    limits: WireLimits,
) -> ExecutionRequest {
    ExecutionRequest {
        session_id,
        language,
        files: files
            .into_iter()
            .map(|f| Source {
                path: f.path,
                content: Bytes::from(f.content.into_bytes()),
                entry: f.entry,
            })
            .collect(),
        limits: limits.into(),
    }
}

/// One server→client frame. `rejected` never reaches the multiplexer: it is a C1-only reply
/// to a command that was refused before admission, so it is constructed directly by the gateway
/// rather than converted from a `multiplex::Frame`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Stdout { data: String, ts: u64 },
    Stderr { data: String, ts: u64 },
    System { data: String, ts: u64 },
    Exit { code: i32, reason: &'static str },
    Rejected { kind: &'static str, message: String },
}

impl OutboundMessage {
    pub fn rejected(kind: RejectionKind, message: impl Into<String>) -> Self {
        OutboundMessage::Rejected {
            kind: kind.as_str(),
            message: message.into(),
        }
    }
}

impl From<Frame> for OutboundMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Stdout { data, ts_ms } => OutboundMessage::Stdout {
                data: String::from_utf8_lossy(&data).into_owned(),
                ts: ts_ms,
            },
            Frame::Stderr { data, ts_ms } => OutboundMessage::Stderr {
                data: String::from_utf8_lossy(&data).into_owned(),
                ts: ts_ms,
            },
            Frame::System { message, ts_ms } => OutboundMessage::System {
                data: message,
                ts: ts_ms,
            },
            Frame::Exit { code, reason } => OutboundMessage::Exit {
                code,
                reason: exit_reason_str(reason),
            },
        }
    }
}

fn exit_reason_str(reason: ExitReason) -> &'static str {
    match reason {
        ExitReason::Ok => "ok",
        ExitReason::Crashed => "crash",
        ExitReason::Unavailable => "unavailable",
        ExitReason::Io => "io",
        ExitReason::Timeout => "timeout",
        ExitReason::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_parses() {
        let json = r#"{"type":"run","language":"python","files":[{"path":"main.py","content":"print(1)","entry":true}],"limits":{"deadlineMs":5000}}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        match msg {
            InboundMessage::Run { language, files, limits } => {
                assert_eq!(language, "python");
                assert_eq!(files.len(), 1);
                assert_eq!(limits.deadline_ms, Some(5000));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn stdin_and_cancel_parse() {
        assert!(matches!(
            serde_json::from_str::<InboundMessage>(r#"{"type":"stdin","data":"x"}"#).unwrap(),
            InboundMessage::Stdin { .. }
        ));
        assert!(matches!(
            serde_json::from_str::<InboundMessage>(r#"{"type":"cancel"}"#).unwrap(),
            InboundMessage::Cancel {}
        ));
    }

    #[test]
    fn exit_frame_serializes_with_reason_string() {
        let msg = OutboundMessage::from(Frame::Exit { code: 0, reason: ExitReason::Ok });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "exit");
        assert_eq!(value["reason"], "ok");
    }

    #[test]
    fn rejected_is_not_derived_from_a_frame() {
        let msg = OutboundMessage::rejected(RejectionKind::Busy, "a job is already running");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "rejected");
        assert_eq!(value["kind"], "busy");
    }
}
