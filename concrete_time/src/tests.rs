// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use super::{Duration, TimeSpan};
use std::time::SystemTime;

#[test]
fn convert_from_std_duration() {
    let duration: Duration = std::time::Duration::new(100, 56).into();
    assert_eq!(
        Duration {
            secs: 100,
            nanos: 56,
        },
        duration
    );
}

#[test]
fn convert_into_std_duration() {
    let duration: std::time::Duration = Duration {
        secs: 100,
        nanos: 56,
    }
    .into();
    assert_eq!(std::time::Duration::new(100, 56), duration);
}

#[test]
fn time_span_since() {
    let start = SystemTime::now();
    let span = TimeSpan::since(&start);
    assert_eq!(start.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs(), span.start.secs);
}

fn time_span_from_start_and_duration_in_seconds(start: u64, duration: u64) -> TimeSpan {
    let start_time = std::time::UNIX_EPOCH + std::time::Duration::new(start, 0);
    let end_time = start_time + std::time::Duration::new(duration, 0);
    TimeSpan::from_start_and_end_systemtime(&start_time, &end_time)
}

#[test]
fn time_span_from_start_and_end_systemtime_computes_duration() {
    let span = time_span_from_start_and_duration_in_seconds(100, 10);
    assert_eq!(span.start.secs, 100);
    assert_eq!(span.duration.secs, 10);
}

#[test]
fn time_span_from_start_and_end_systemtime_clamps_negative_duration() {
    let start_time = std::time::UNIX_EPOCH + std::time::Duration::new(100, 0);
    let end_time = std::time::UNIX_EPOCH + std::time::Duration::new(50, 0);
    let span = TimeSpan::from_start_and_end_systemtime(&start_time, &end_time);
    assert_eq!(span.duration, Duration::new(0, 0));
}

#[test]
fn time_span_from_prost_timestamp() {
    let start = prost_types::Timestamp {
        seconds: 100,
        nanos: 0,
    };
    let end = prost_types::Timestamp {
        seconds: 110,
        nanos: 0,
    };
    let span = TimeSpan::from_start_and_end(&start, &end, "test").unwrap();
    assert_eq!(span.start.secs, 100);
    assert_eq!(span.duration.secs, 10);
}

#[test]
fn time_span_from_prost_timestamp_errors_on_negative_duration() {
    let start = prost_types::Timestamp {
        seconds: 110,
        nanos: 0,
    };
    let end = prost_types::Timestamp {
        seconds: 100,
        nanos: 0,
    };
    assert!(TimeSpan::from_start_and_end(&start, &end, "test").is_err());
}
