// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::NaiveDate;
use config::Language;
use hdrhistogram::Histogram;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Crashed,
    Timeout,
    Cancelled,
    Infrastructure,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Crashed => "crashed",
            Outcome::Timeout => "timeout",
            Outcome::Cancelled => "cancelled",
            Outcome::Infrastructure => "infrastructure",
        }
    }
}

/// One completed job, as reported to the recorder by the pipeline at Cleanup.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub session_id: String,
    pub sandbox_id: String,
    pub language: Language,
    pub outcome: Outcome,
    pub total: Duration,
    pub reused: bool,
}

/// Per-calendar-day aggregates, exported verbatim over `GET /stats` and archived to
/// `report-YYYY-MM-DD.json` on rollover.
#[derive(Debug, Clone, Serialize)]
pub struct DailyMetrics {
    pub date: NaiveDate,
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub unique_sessions: u64,
    pub unique_sandboxes: u64,
    pub latency: LatencySummary,
    pub requests_by_language: HashMap<String, u64>,
    pub requests_by_outcome: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Mutable accumulator backing one day's bucket. Kept separate from `DailyMetrics` so the
/// histogram (not serializable in a useful form) doesn't leak into the public snapshot type.
#[derive(Debug)]
pub(crate) struct DailyBucket {
    date: NaiveDate,
    total: u64,
    successful: u64,
    failed: u64,
    sessions: HashSet<String>,
    sandboxes: HashSet<String>,
    by_language: HashMap<String, u64>,
    by_outcome: HashMap<String, u64>,
    latency_us: Histogram<u64>,
}

impl DailyBucket {
    pub(crate) fn new(date: NaiveDate) -> Self {
        DailyBucket {
            date,
            total: 0,
            successful: 0,
            failed: 0,
            sessions: HashSet::new(),
            sandboxes: HashSet::new(),
            by_language: HashMap::new(),
            by_outcome: HashMap::new(),
            latency_us: Histogram::new(3).expect("histogram parameters are valid"),
        }
    }

    pub(crate) fn record(&mut self, job: &JobRecord) {
        self.total += 1;
        if job.outcome == Outcome::Ok {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.sessions.insert(job.session_id.clone());
        self.sandboxes.insert(job.sandbox_id.clone());
        *self
            .by_language
            .entry(job.language.as_str().to_string())
            .or_insert(0) += 1;
        *self
            .by_outcome
            .entry(job.outcome.as_str().to_string())
            .or_insert(0) += 1;
        let _ = self.latency_us.record(job.total.as_micros() as u64);
    }

    pub(crate) fn snapshot(&self) -> DailyMetrics {
        let to_ms = |us: u64| us as f64 / 1000.0;
        let latency = if self.latency_us.len() == 0 {
            LatencySummary::default()
        } else {
            LatencySummary {
                min_ms: to_ms(self.latency_us.min()),
                avg_ms: to_ms(self.latency_us.mean() as u64),
                median_ms: to_ms(self.latency_us.value_at_quantile(0.50)),
                p95_ms: to_ms(self.latency_us.value_at_quantile(0.95)),
                p99_ms: to_ms(self.latency_us.value_at_quantile(0.99)),
                max_ms: to_ms(self.latency_us.max()),
            }
        };
        DailyMetrics {
            date: self.date,
            total: self.total,
            successful: self.successful,
            failed: self.failed,
            unique_sessions: self.sessions.len() as u64,
            unique_sandboxes: self.sandboxes.len() as u64,
            latency,
            requests_by_language: self.by_language.clone(),
            requests_by_outcome: self.by_outcome.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(outcome: Outcome, total_ms: u64) -> JobRecord {
        JobRecord {
            session_id: "s1".to_string(),
            sandbox_id: "b1".to_string(),
            language: Language::Python,
            outcome,
            total: Duration::from_millis(total_ms),
            reused: false,
        }
    }

    #[test]
    fn bucket_tracks_success_and_failure_counts() {
        let mut bucket = DailyBucket::new(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        bucket.record(&job(Outcome::Ok, 10));
        bucket.record(&job(Outcome::Timeout, 1200));
        let snap = bucket.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.successful, 1);
        assert_eq!(snap.failed, 1);
        assert!(snap.latency.max_ms >= 1199.0);
    }
}
