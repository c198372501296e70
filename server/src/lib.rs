// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Session Gateway (C1) and administrator HTTP surface, plus the top-level `Service` that
//! wires them to the admission queue (C2), sandbox pool (C3), execution pipeline (C4), I/O
//! multiplexer (C5), and telemetry recorder (C6) built by the `execution`/`sandbox`/`multiplex`/
//! `telemetry` crates.

pub mod admin;
pub mod gateway;
pub mod log_ring;
pub mod reports;
pub mod service;
pub mod wire;

pub use gateway::GatewayServer;
pub use log_ring::{LogRecord, LogRing, RingLogger};
pub use service::Service;
