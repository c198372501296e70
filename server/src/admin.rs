// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The administrator HTTP surface: a second `axum` listener bound to `Config::admin_bind_addr`,
//! gated by an `X-Admin-Token` header compared in constant time against
//! `Config::administrator_credential_hash`. Query-parameter token passing is deliberately not
//! implemented, since query strings tend to end up in access logs.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use config::Config;
use log::Level;
use serde::Serialize;
use telemetry::TelemetryRecorder;
use tokio::net::TcpListener;

use crate::log_ring::LogRing;
use crate::reports;

#[derive(Clone)]
struct AdminState {
    telemetry: TelemetryRecorder,
    log_ring: LogRing,
    config: Arc<Config>,
}

pub fn router(telemetry: TelemetryRecorder, log_ring: LogRing, config: Arc<Config>) -> Router {
    let state = AdminState { telemetry, log_ring, config: config.clone() };
    Router::new()
        .route("/stats", get(stats))
        .route("/pipeline-metrics", get(pipeline_metrics))
        .route("/logs", get(logs))
        .route("/reset", post(reset))
        .route("/reports", get(reports_endpoint))
        .with_state(state)
        .layer(middleware::from_fn_with_state(config, require_admin_token))
}

pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(listener, router).await
}

/// Compares the `X-Admin-Token` header against the configured hash without branching on the
/// index of the first mismatching byte, so a timing side-channel can't narrow down the secret one
/// byte at a time.
async fn require_admin_token(
    State(config): State<Arc<Config>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let provided = headers
        .get("X-Admin-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if config.administrator_credential_hash.is_empty() || !constant_time_eq(provided.as_bytes(), config.administrator_credential_hash.as_bytes()) {
        return (StatusCode::UNAUTHORIZED, "invalid or missing X-Admin-Token").into_response();
    }
    next.run(request).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn stats(State(state): State<AdminState>) -> Json<telemetry::Snapshot> {
    Json(state.telemetry.snapshot())
}

async fn pipeline_metrics(State(state): State<AdminState>) -> Json<telemetry::PipelineMetricsSnapshot> {
    Json(state.telemetry.pipeline_metrics())
}

#[derive(Debug, serde::Deserialize)]
struct LogsQuery {
    level: Option<String>,
    category: Option<String>,
    search: Option<String>,
    limit: Option<usize>,
}

async fn logs(State(state): State<AdminState>, Query(query): Query<LogsQuery>) -> Response {
    let level = match query.level.as_deref() {
        Some(s) => match s.parse::<Level>() {
            Ok(l) => Some(l),
            Err(_) => return (StatusCode::BAD_REQUEST, format!("invalid level: {s}")).into_response(),
        },
        None => None,
    };
    let limit = query.limit.unwrap_or(200).min(5_000);
    let records = state.log_ring.query(level, query.category.as_deref(), query.search.as_deref(), limit);
    Json(records).into_response()
}

async fn reset(State(state): State<AdminState>) -> StatusCode {
    state.telemetry.reset();
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
struct ReportsError {
    message: String,
}

async fn reports_endpoint(State(state): State<AdminState>, Query(query): Query<HashMap<String, String>>) -> Response {
    let Some(date_str) = query.get("date") else {
        return (StatusCode::BAD_REQUEST, "missing required query parameter: date").into_response();
    };
    let date = match NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
        Ok(d) => d,
        Err(_) => return (StatusCode::BAD_REQUEST, format!("invalid date: {date_str}")).into_response(),
    };
    match reports::read_day(&state.config.report_archive_dir, date).await {
        Ok(metrics) => Json(metrics).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(ReportsError { message: format!("no archived report for {date}") }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_different_lengths_and_content() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"wrongg"));
    }
}
