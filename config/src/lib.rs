// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Layered configuration for the execution service: compiled-in defaults, overridden by a TOML
//! file, overridden by `CODE_EXEC_*` environment variables.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for environment variable {name}: {value}")]
    BadEnvValue { name: String, value: String },
}

/// One supported language tag. Closed set: see `Config::sandbox_image`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Java,
    Cpp,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::Javascript,
        Language::Java,
        Language::Cpp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }

    pub fn parse(tag: &str) -> Option<Language> {
        Self::ALL.into_iter().find(|l| l.as_str() == tag)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrent: usize,
    pub max_sandboxes: usize,
    pub per_lang_warm_cap: usize,
    pub idle_ttl: DurationMs,
    pub max_age: DurationMs,
    pub default_deadline_ms: DurationMs,
    pub hard_deadline_ms: DurationMs,
    pub grace_ms: DurationMs,
    pub output_frame_buffer_per_session: usize,
    pub sandbox_image: HashMap<String, String>,
    pub sandbox_network_subnet_pool: String,
    pub administrator_credential_hash: String,
    pub sweep_interval: DurationMs,
    pub spawn_timeout: DurationMs,
    pub release_timeout: DurationMs,
    pub admin_bind_addr: String,
    pub gateway_bind_addr: String,
    pub report_archive_dir: String,
    pub log_ring_capacity: usize,
    pub per_job_source_byte_cap: usize,
}

/// Newtype so config fields read naturally as milliseconds in TOML/env but convert cleanly
/// to `std::time::Duration` at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct DurationMs(pub u64);

impl DurationMs {
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut sandbox_image = HashMap::new();
        sandbox_image.insert("python".to_string(), "code-exec/python:3.12".to_string());
        sandbox_image.insert("javascript".to_string(), "code-exec/node:20".to_string());
        sandbox_image.insert("java".to_string(), "code-exec/java:21".to_string());
        sandbox_image.insert("cpp".to_string(), "code-exec/cpp:gcc13".to_string());

        Config {
            max_concurrent: 16,
            max_sandboxes: 32,
            per_lang_warm_cap: 4,
            idle_ttl: DurationMs(5 * 60_000),
            max_age: DurationMs(60 * 60_000),
            default_deadline_ms: DurationMs(30_000),
            hard_deadline_ms: DurationMs(120_000),
            grace_ms: DurationMs(2_000),
            output_frame_buffer_per_session: 2_000,
            sandbox_image,
            sandbox_network_subnet_pool: "10.200.0.0/16".to_string(),
            administrator_credential_hash: String::new(),
            sweep_interval: DurationMs(30_000),
            spawn_timeout: DurationMs(15_000),
            release_timeout: DurationMs(5_000),
            admin_bind_addr: "127.0.0.1:9090".to_string(),
            gateway_bind_addr: "0.0.0.0:8080".to_string(),
            report_archive_dir: "./reports".to_string(),
            log_ring_capacity: 2_000,
            per_job_source_byte_cap: 8 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load defaults, merge a TOML file at `path` if it exists, then apply `CODE_EXEC_*`
    /// environment overrides. Defaults establish every field, so a bare `load(None)` with no
    /// environment variables set always succeeds.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = path {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                let file_config: PartialConfig =
                    toml::from_str(&text).map_err(|source| ConfigError::Parse {
                        path: path.display().to_string(),
                        source,
                    })?;
                file_config.merge_into(&mut config);
            }
        }

        apply_env_overrides(&mut config)?;
        Ok(config)
    }
}

/// Every field optional, so a TOML file may set only the fields it cares about.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialConfig {
    max_concurrent: Option<usize>,
    max_sandboxes: Option<usize>,
    per_lang_warm_cap: Option<usize>,
    idle_ttl: Option<u64>,
    max_age: Option<u64>,
    default_deadline_ms: Option<u64>,
    hard_deadline_ms: Option<u64>,
    grace_ms: Option<u64>,
    output_frame_buffer_per_session: Option<usize>,
    sandbox_image: Option<HashMap<String, String>>,
    sandbox_network_subnet_pool: Option<String>,
    administrator_credential_hash: Option<String>,
    sweep_interval: Option<u64>,
    spawn_timeout: Option<u64>,
    release_timeout: Option<u64>,
    admin_bind_addr: Option<String>,
    gateway_bind_addr: Option<String>,
    report_archive_dir: Option<String>,
    log_ring_capacity: Option<usize>,
    per_job_source_byte_cap: Option<usize>,
}

impl PartialConfig {
    fn merge_into(self, config: &mut Config) {
        macro_rules! set {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    config.$field = v;
                }
            };
            ($field:ident, ms) => {
                if let Some(v) = self.$field {
                    config.$field = DurationMs(v);
                }
            };
        }
        set!(max_concurrent);
        set!(max_sandboxes);
        set!(per_lang_warm_cap);
        set!(idle_ttl, ms);
        set!(max_age, ms);
        set!(default_deadline_ms, ms);
        set!(hard_deadline_ms, ms);
        set!(grace_ms, ms);
        set!(output_frame_buffer_per_session);
        if let Some(images) = self.sandbox_image {
            config.sandbox_image.extend(images);
        }
        set!(sandbox_network_subnet_pool);
        set!(administrator_credential_hash);
        set!(sweep_interval, ms);
        set!(spawn_timeout, ms);
        set!(release_timeout, ms);
        set!(admin_bind_addr);
        set!(gateway_bind_addr);
        set!(report_archive_dir);
        set!(log_ring_capacity);
        set!(per_job_source_byte_cap);
    }
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    fn env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
        env_parsed(name, |v| v.parse::<usize>().ok())
    }
    fn env_ms(name: &str) -> Result<Option<DurationMs>, ConfigError> {
        env_parsed(name, |v| v.parse::<u64>().ok().map(DurationMs))
    }
    fn env_parsed<T>(
        name: &str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<T>, ConfigError> {
        match env::var(name) {
            Ok(value) => parse(&value)
                .map(Some)
                .ok_or_else(|| ConfigError::BadEnvValue {
                    name: name.to_string(),
                    value,
                }),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(env::VarError::NotUnicode(_)) => Ok(None),
        }
    }

    if let Some(v) = env_usize("CODE_EXEC_MAX_CONCURRENT")? {
        config.max_concurrent = v;
    }
    if let Some(v) = env_usize("CODE_EXEC_MAX_SANDBOXES")? {
        config.max_sandboxes = v;
    }
    if let Some(v) = env_usize("CODE_EXEC_PER_LANG_WARM_CAP")? {
        config.per_lang_warm_cap = v;
    }
    if let Some(v) = env_ms("CODE_EXEC_IDLE_TTL")? {
        config.idle_ttl = v;
    }
    if let Some(v) = env_ms("CODE_EXEC_MAX_AGE")? {
        config.max_age = v;
    }
    if let Some(v) = env_ms("CODE_EXEC_DEFAULT_DEADLINE_MS")? {
        config.default_deadline_ms = v;
    }
    if let Some(v) = env_ms("CODE_EXEC_HARD_DEADLINE_MS")? {
        config.hard_deadline_ms = v;
    }
    if let Some(v) = env_ms("CODE_EXEC_GRACE_MS")? {
        config.grace_ms = v;
    }
    if let Some(v) = env_usize("CODE_EXEC_OUTPUT_FRAME_BUFFER_PER_SESSION")? {
        config.output_frame_buffer_per_session = v;
    }
    if let Ok(v) = env::var("CODE_EXEC_SANDBOX_NETWORK_SUBNET_POOL") {
        config.sandbox_network_subnet_pool = v;
    }
    if let Ok(v) = env::var("CODE_EXEC_ADMINISTRATOR_CREDENTIAL_HASH") {
        config.administrator_credential_hash = v;
    }
    if let Some(v) = env_ms("CODE_EXEC_SWEEP_INTERVAL")? {
        config.sweep_interval = v;
    }
    if let Some(v) = env_ms("CODE_EXEC_SPAWN_TIMEOUT")? {
        config.spawn_timeout = v;
    }
    if let Some(v) = env_ms("CODE_EXEC_RELEASE_TIMEOUT")? {
        config.release_timeout = v;
    }
    if let Ok(v) = env::var("CODE_EXEC_ADMIN_BIND_ADDR") {
        config.admin_bind_addr = v;
    }
    if let Ok(v) = env::var("CODE_EXEC_GATEWAY_BIND_ADDR") {
        config.gateway_bind_addr = v;
    }
    if let Ok(v) = env::var("CODE_EXEC_REPORT_ARCHIVE_DIR") {
        config.report_archive_dir = v;
    }
    if let Some(v) = env_usize("CODE_EXEC_LOG_RING_CAPACITY")? {
        config.log_ring_capacity = v;
    }
    if let Some(v) = env_usize("CODE_EXEC_PER_JOB_SOURCE_BYTE_CAP")? {
        config.per_job_source_byte_cap = v;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::default();
        assert_eq!(config.max_concurrent, 16);
        assert_eq!(config.sandbox_image.len(), 4);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent = 4\nper_lang_warm_cap = 1").unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.per_lang_warm_cap, 1);
        assert_eq!(config.max_sandboxes, 32, "unset fields keep defaults");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/path.toml"))).unwrap();
        assert_eq!(config.max_concurrent, Config::default().max_concurrent);
    }

    #[test]
    fn language_round_trips() {
        for lang in Language::ALL {
            assert_eq!(Language::parse(lang.as_str()), Some(lang));
        }
        assert_eq!(Language::parse("ruby"), None);
    }
}
