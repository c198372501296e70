// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;
use config::Language;

/// One file submitted with a `run` request. `entry` marks the program's entrypoint; exactly one
/// source must carry it.
#[derive(Debug, Clone)]
pub struct Source {
    pub path: String,
    pub content: Bytes,
    pub entry: bool,
}

/// Per-job overrides of the service's configured defaults; absent fields fall back to `Config`.
#[derive(Debug, Clone, Default)]
pub struct JobLimits {
    pub mem_mb: Option<u64>,
    pub cpu: Option<f64>,
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub session_id: String,
    pub language: Language,
    pub files: Vec<Source>,
    pub limits: JobLimits,
}

impl ExecutionRequest {
    pub fn entry_source(&self) -> Option<&Source> {
        self.files.iter().find(|f| f.entry)
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.content.len()).sum()
    }
}
