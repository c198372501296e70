// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The `GET /logs` backing store: a bounded in-memory ring of structured records, mirrored off
//! every record that `env_logger`'s filter lets through: one filter, one sink, one ring.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    pub message: String,
    pub ts_ms: u64,
}

struct RingInner {
    records: VecDeque<LogRecord>,
    capacity: usize,
}

/// Shared handle to the ring; cloneable so the admin surface can query it without holding a
/// reference to the installed `log::Log` implementation.
#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Mutex<RingInner>>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        LogRing {
            inner: Arc::new(Mutex::new(RingInner {
                records: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
            })),
        }
    }

    fn push(&self, record: LogRecord) {
        let mut inner = self.inner.lock();
        if inner.records.len() >= inner.capacity {
            inner.records.pop_front();
        }
        inner.records.push_back(record);
    }

    /// `GET /logs?level=&category=&search=&limit=`: most recent first, filtered, then truncated.
    pub fn query(&self, level: Option<Level>, category: Option<&str>, search: Option<&str>, limit: usize) -> Vec<LogRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .rev()
            .filter(|r| level.map(|l| level_at_least(&r.level, l)).unwrap_or(true))
            .filter(|r| category.map(|c| r.target.contains(c)).unwrap_or(true))
            .filter(|r| search.map(|s| r.message.contains(s)).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }
}

fn level_at_least(record_level: &str, floor: Level) -> bool {
    record_level
        .parse::<Level>()
        .map(|l| l <= floor)
        .unwrap_or(true)
}

/// Installed as the single process-wide `log::Log`: every record that passes `env_logger`'s own
/// filter is written to stderr exactly as `env_logger` would have written it, and duplicated into
/// the ring. Built once at startup via `install`.
pub struct RingLogger {
    inner: env_logger::Logger,
    ring: LogRing,
}

impl RingLogger {
    /// Installs the combined logger as the process-wide `log` sink and returns the `LogRing`
    /// handle for the admin surface to query. Idempotent only in the sense that `log::set_boxed_logger`
    /// itself is not — callers must call this exactly once per process.
    pub fn install(ring_capacity: usize) -> Result<LogRing, log::SetLoggerError> {
        let inner = env_logger::Builder::from_default_env().build();
        let max_level = inner.filter();
        let ring = LogRing::new(ring_capacity);
        let logger = RingLogger { inner, ring: ring.clone() };
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max_level);
        Ok(ring)
    }
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.ring.push(LogRecord {
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            ts_ms: now_ms(),
        });
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: &str, msg: &str) -> LogRecord {
        LogRecord {
            level: level.to_string(),
            target: "code_exec::gateway".to_string(),
            message: msg.to_string(),
            ts_ms: 0,
        }
    }

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let ring = LogRing::new(2);
        ring.push(record("INFO", "one"));
        ring.push(record("INFO", "two"));
        ring.push(record("INFO", "three"));
        let all = ring.query(None, None, None, 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "three");
        assert_eq!(all[1].message, "two");
    }

    #[test]
    fn query_filters_by_level_category_and_search() {
        let ring = LogRing::new(10);
        ring.push(record("WARN", "slow sandbox acquire"));
        ring.push(record("INFO", "session connected"));
        let warnings = ring.query(Some(Level::Warn), None, None, 10);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "slow sandbox acquire");

        let matches = ring.query(None, None, Some("session"), 10);
        assert_eq!(matches.len(), 1);
    }
}
