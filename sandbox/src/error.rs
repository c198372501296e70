// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to create network: {0}")]
    NetworkCreate(String),
    #[error("failed to destroy network {0}: {1}")]
    NetworkDestroy(String, String),
    #[error("failed to spawn sandbox for image {image}: {reason}")]
    Spawn { image: String, reason: String },
    #[error("timed out waiting for sandbox readiness after {0:?}")]
    ReadinessTimeout(std::time::Duration),
    #[error("failed to copy {path} into sandbox {sandbox_id}: {reason}")]
    Copy {
        sandbox_id: String,
        path: String,
        reason: String,
    },
    #[error("failed to exec in sandbox {sandbox_id}: {reason}")]
    Exec { sandbox_id: String, reason: String },
    #[error("failed to signal sandbox {0}: {1}")]
    Kill(String, String),
    #[error("failed to destroy sandbox {0}: {1}")]
    Destroy(String, String),
    #[error("no idle or spawnable sandbox available for language {0}")]
    Unavailable(String),
    #[error("io error communicating with sandbox {0}: {1}")]
    Io(String, String),
}
