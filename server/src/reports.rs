// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Daily report archival: at midnight rollover (and on `GET /reports?date=`), a completed day's
//! `DailyMetrics` is written to `report-YYYY-MM-DD.json` under `Config::report_archive_dir`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use telemetry::{DailyMetrics, TelemetryRecorder};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to create report archive directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to write report {0}: {1}")]
    Write(String, std::io::Error),
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to read report {0}: {1}")]
    Read(String, std::io::Error),
    #[error("no archived report for {0}")]
    NotFound(NaiveDate),
}

fn report_path(dir: &str, date: NaiveDate) -> PathBuf {
    Path::new(dir).join(format!("report-{date}.json"))
}

/// Serializes and writes one day's metrics. Used both by the midnight rollover task and directly
/// by tests; the admin `/reports` route only ever reads what this has already written.
pub async fn archive_day(dir: &str, metrics: &DailyMetrics) -> Result<PathBuf, ReportError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ReportError::CreateDir(dir.to_string(), e))?;
    let path = report_path(dir, metrics.date);
    let body = serde_json::to_vec_pretty(metrics)?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| ReportError::Write(path.display().to_string(), e))?;
    Ok(path)
}

/// Reads a previously archived day's report back off disk, for `GET /reports?date=`.
pub async fn read_day(dir: &str, date: NaiveDate) -> Result<DailyMetrics, ReportError> {
    let path = report_path(dir, date);
    let body = tokio::fs::read(&path)
        .await
        .map_err(|_| ReportError::NotFound(date))?;
    serde_json::from_slice(&body).map_err(ReportError::from)
}

/// Drains every daily bucket strictly before today from `telemetry` and archives each to disk.
/// Run once at startup (to flush a day the process never saw roll over) and then on each tick of
/// the rollover task.
pub async fn roll_over(dir: &str, telemetry: &TelemetryRecorder) {
    let today = Local::now().date_naive();
    for metrics in telemetry.take_completed_days(today) {
        let date = metrics.date;
        if let Err(e) = archive_day(dir, &metrics).await {
            log::warn!("failed to archive report for {date}: {e}");
        } else {
            log::info!("archived daily report for {date}");
        }
    }
}

/// Runs `roll_over` once per `interval`, forever. Intended to be spawned as a tail task owned by
/// the top-level `Service` so it is drained on graceful shutdown rather than abandoned mid-write.
pub async fn rollover_loop(dir: String, telemetry: TelemetryRecorder, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        roll_over(&dir, &telemetry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry::{job_record, Outcome};

    #[tokio::test]
    async fn archive_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = TelemetryRecorder::new(10);
        telemetry.record_job(job_record(
            "s1",
            "b1",
            config::Language::Python,
            Outcome::Ok,
            Duration::from_millis(10),
            false,
        ));
        let snapshot = telemetry.snapshot().today;
        let path = archive_day(dir.path().to_str().unwrap(), &snapshot).await.unwrap();
        assert!(path.exists());

        let read_back = read_day(dir.path().to_str().unwrap(), snapshot.date).await.unwrap();
        assert_eq!(read_back.total, 1);
    }

    #[tokio::test]
    async fn read_missing_day_errors() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let err = read_day(dir.path().to_str().unwrap(), date).await.unwrap_err();
        assert!(matches!(err, ReportError::NotFound(_)));
    }
}
