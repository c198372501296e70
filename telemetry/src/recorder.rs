// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};
use config::Language;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use strum::IntoEnumIterator;

use crate::metrics::{Counter, Stage};
use crate::rollup::{DailyBucket, DailyMetrics, JobRecord, Outcome};

/// One entry in the bounded "slow executions" list.
#[derive(Debug, Clone, Serialize)]
pub struct SlowExecution {
    pub session_id: String,
    pub language: String,
    pub total_ms: f64,
    pub reused: bool,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StagePercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl StagePercentiles {
    fn from_histogram(h: &Histogram<u64>) -> Self {
        if h.len() == 0 {
            return StagePercentiles::default();
        }
        let to_ms = |us: u64| us as f64 / 1000.0;
        StagePercentiles {
            p50_ms: to_ms(h.value_at_quantile(0.50)),
            p95_ms: to_ms(h.value_at_quantile(0.95)),
            p99_ms: to_ms(h.value_at_quantile(0.99)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub queued: usize,
    pub active: usize,
    pub active_clients: usize,
    pub counters: HashMap<String, u64>,
    pub today: DailyMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetricsSnapshot {
    pub stages: HashMap<String, StagePercentiles>,
    pub total: StagePercentiles,
    pub slow_executions: Vec<SlowExecution>,
}

/// The slow-execution threshold named in the glossary: any job whose total exceeds this is
/// recorded into the bounded ring regardless of outcome.
const SLOW_EXECUTION_THRESHOLD: Duration = Duration::from_millis(1000);

struct Inner {
    counters: Mutex<HashMap<Counter, u64>>,
    stage_histograms: Mutex<HashMap<Stage, Histogram<u64>>>,
    total_histogram: Mutex<Histogram<u64>>,
    daily: Mutex<BTreeMap<NaiveDate, DailyBucket>>,
    slow_executions: Mutex<VecDeque<SlowExecution>>,
    slow_cap: usize,
    queued: AtomicUsize,
    active: AtomicUsize,
    active_clients: AtomicUsize,
}

/// Thread-safe in-memory telemetry store (C6). Updated at admission enqueue/grant, each pipeline
/// stage transition, job completion, sandbox spawn/reuse/destroy, and session connect/disconnect.
/// Cloning is cheap: all state lives behind the shared `Inner`.
#[derive(Clone)]
pub struct TelemetryRecorder {
    inner: std::sync::Arc<Inner>,
}

impl TelemetryRecorder {
    pub fn new(slow_cap: usize) -> Self {
        TelemetryRecorder {
            inner: std::sync::Arc::new(Inner {
                counters: Mutex::new(HashMap::new()),
                stage_histograms: Mutex::new(HashMap::new()),
                total_histogram: Mutex::new(
                    Histogram::new(3).expect("histogram parameters are valid"),
                ),
                daily: Mutex::new(BTreeMap::new()),
                slow_executions: Mutex::new(VecDeque::new()),
                slow_cap,
                queued: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                active_clients: AtomicUsize::new(0),
            }),
        }
    }

    pub fn increment_counter(&self, counter: Counter, change: u64) {
        *self.inner.counters.lock().entry(counter).or_insert(0) += change;
    }

    pub fn inc_queued(&self) {
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
    }
    pub fn dec_queued(&self) {
        self.inner.queued.fetch_sub(1, Ordering::Relaxed);
    }
    pub fn inc_active(&self) {
        self.inner.active.fetch_add(1, Ordering::Relaxed);
    }
    pub fn dec_active(&self) {
        self.inner.active.fetch_sub(1, Ordering::Relaxed);
    }
    pub fn inc_active_clients(&self) {
        self.inner.active_clients.fetch_add(1, Ordering::Relaxed);
    }
    pub fn dec_active_clients(&self) {
        self.inner.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Records one stage's wall-clock duration into its rolling reservoir.
    pub fn record_stage(&self, stage: Stage, duration: Duration) {
        let mut histograms = self.inner.stage_histograms.lock();
        let histogram = histograms
            .entry(stage)
            .or_insert_with(|| Histogram::new(3).expect("histogram parameters are valid"));
        let _ = histogram.record(duration.as_micros() as u64);
    }

    /// Records a completed job: updates the total-duration reservoir, the daily rollup bucket,
    /// and the slow-execution ring if it crossed the threshold.
    pub fn record_job(&self, job: JobRecord) {
        let _ = self
            .inner
            .total_histogram
            .lock()
            .record(job.total.as_micros() as u64);

        let today = Local::now().date_naive();
        self.inner
            .daily
            .lock()
            .entry(today)
            .or_insert_with(|| DailyBucket::new(today))
            .record(&job);

        if job.total >= SLOW_EXECUTION_THRESHOLD {
            let mut ring = self.inner.slow_executions.lock();
            if ring.len() >= self.inner.slow_cap {
                ring.pop_front();
            }
            ring.push_back(SlowExecution {
                session_id: job.session_id,
                language: job.language.as_str().to_string(),
                total_ms: job.total.as_secs_f64() * 1000.0,
                reused: job.reused,
                at: Local::now(),
            });
        }
    }

    /// Removes and returns every daily bucket strictly before `today`, for archival by the
    /// caller. Buckets for `today` and later are left untouched.
    pub fn take_completed_days(&self, today: NaiveDate) -> Vec<DailyMetrics> {
        let mut daily = self.inner.daily.lock();
        let keep = daily.split_off(&today);
        let completed = std::mem::replace(&mut *daily, keep);
        completed.into_values().map(|b| b.snapshot()).collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        let counters = self
            .inner
            .counters
            .lock()
            .iter()
            .map(|(c, v)| (c.as_str().to_string(), *v))
            .collect();

        let today = Local::now().date_naive();
        let today_metrics = self
            .inner
            .daily
            .lock()
            .get(&today)
            .map(|b| b.snapshot())
            .unwrap_or_else(|| DailyBucket::new(today).snapshot());

        Snapshot {
            queued: self.inner.queued.load(Ordering::Relaxed),
            active: self.inner.active.load(Ordering::Relaxed),
            active_clients: self.inner.active_clients.load(Ordering::Relaxed),
            counters,
            today: today_metrics,
        }
    }

    pub fn pipeline_metrics(&self) -> PipelineMetricsSnapshot {
        let histograms = self.inner.stage_histograms.lock();
        let stages = Stage::iter()
            .map(|stage| {
                let percentiles = histograms
                    .get(&stage)
                    .map(StagePercentiles::from_histogram)
                    .unwrap_or_default();
                (stage.as_str().to_string(), percentiles)
            })
            .collect();
        let total = StagePercentiles::from_histogram(&self.inner.total_histogram.lock());
        let slow_executions = self.inner.slow_executions.lock().iter().cloned().collect();

        PipelineMetricsSnapshot {
            stages,
            total,
            slow_executions,
        }
    }

    /// `POST /reset`: zero counters and rollups. Idempotent, destructive.
    pub fn reset(&self) {
        self.inner.counters.lock().clear();
        self.inner.stage_histograms.lock().clear();
        *self.inner.total_histogram.lock() = Histogram::new(3).expect("valid params");
        self.inner.daily.lock().clear();
        self.inner.slow_executions.lock().clear();
    }

    pub fn set_active_clients(&self, count: usize) {
        self.inner.active_clients.store(count, Ordering::Relaxed);
    }
}

// Re-exported so callers can build a `JobRecord` without depending on the `rollup` module path.
pub fn job_record(
    session_id: impl Into<String>,
    sandbox_id: impl Into<String>,
    language: Language,
    outcome: Outcome,
    total: Duration,
    reused: bool,
) -> JobRecord {
    JobRecord {
        session_id: session_id.into(),
        sandbox_id: sandbox_id.into(),
        language,
        outcome,
        total,
        reused,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let recorder = TelemetryRecorder::new(10);
        recorder.increment_counter(Counter::AdmissionEnqueued, 1);
        recorder.increment_counter(Counter::AdmissionEnqueued, 2);
        let snap = recorder.snapshot();
        assert_eq!(snap.counters["admission_enqueued"], 3);
    }

    #[test]
    fn slow_execution_ring_is_capped() {
        let recorder = TelemetryRecorder::new(2);
        for i in 0..5 {
            recorder.record_job(job_record(
                format!("s{i}"),
                format!("b{i}"),
                Language::Python,
                Outcome::Ok,
                Duration::from_millis(1500),
                false,
            ));
        }
        let metrics = recorder.pipeline_metrics();
        assert_eq!(metrics.slow_executions.len(), 2);
        assert_eq!(metrics.slow_executions[0].session_id, "s3");
        assert_eq!(metrics.slow_executions[1].session_id, "s4");
    }

    #[test]
    fn fast_jobs_never_enter_slow_ring() {
        let recorder = TelemetryRecorder::new(10);
        recorder.record_job(job_record(
            "s0",
            "b0",
            Language::Python,
            Outcome::Ok,
            Duration::from_millis(10),
            true,
        ));
        assert!(recorder.pipeline_metrics().slow_executions.is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let recorder = TelemetryRecorder::new(10);
        recorder.increment_counter(Counter::JobsCompletedOk, 1);
        recorder.record_job(job_record(
            "s0",
            "b0",
            Language::Python,
            Outcome::Ok,
            Duration::from_millis(2000),
            false,
        ));
        recorder.reset();
        let snap = recorder.snapshot();
        assert!(snap.counters.is_empty());
        assert_eq!(snap.today.total, 0);
        assert!(recorder.pipeline_metrics().slow_executions.is_empty());
    }
}
