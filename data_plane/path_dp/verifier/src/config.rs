//! Verifier configuration.
//!
//! Defaults are overlaid with `PATH_VERIFIER_*` environment variables.
//! A variable that is set but does not parse aborts startup with an error
//! naming it.

use log::warn;
use std::path::PathBuf;
use std::str::FromStr;

use crate::adjacency::RetentionPolicy;
use crate::error::{Result, VerifierError};
use crate::pipeline::{OverflowPolicy, QueueConfig};
use crate::recorder::RecorderConfig;

pub const ENV_POLICY: &str = "PATH_VERIFIER_POLICY";
pub const ENV_INPUT: &str = "PATH_VERIFIER_INPUT";
pub const ENV_QUEUE_CAPACITY: &str = "PATH_VERIFIER_QUEUE_CAPACITY";
pub const ENV_OVERFLOW: &str = "PATH_VERIFIER_OVERFLOW";
pub const ENV_MAX_HOPS: &str = "PATH_VERIFIER_MAX_HOPS";
pub const ENV_MAX_REPORTS_PER_HOP: &str = "PATH_VERIFIER_MAX_REPORTS_PER_HOP";
pub const ENV_RETENTION_SECS: &str = "PATH_VERIFIER_RETENTION_SECS";
pub const ENV_RECORD_DB: &str = "PATH_VERIFIER_RECORD_DB";
pub const ENV_RECORD_BATCH: &str = "PATH_VERIFIER_RECORD_BATCH";
pub const ENV_EMIT_JSON: &str = "PATH_VERIFIER_EMIT_JSON";

/// Top-level verifier configuration
#[derive(Debug, Clone, PartialEq)]
pub struct VerifierConfig {
    /// Policy file
    pub policy_path: PathBuf,
    /// Telemetry JSON lines; stdin when `None`
    pub input_path: Option<PathBuf>,
    pub queue: QueueConfig,
    pub retention: RetentionPolicy,
    /// SQLite report recording; disabled when `None`
    pub recorder: Option<RecorderConfig>,
    /// Also write match events as JSON lines to stdout
    pub emit_json: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            policy_path: PathBuf::from("policy.txt"),
            input_path: None,
            queue: QueueConfig::default(),
            retention: RetentionPolicy::default(),
            recorder: None,
            emit_json: false,
        }
    }
}

impl VerifierConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(ENV_POLICY) {
            config.policy_path = PathBuf::from(path);
        }
        if let Some(path) = get(ENV_INPUT) {
            config.input_path = Some(PathBuf::from(path));
        }

        if let Some(value) = get(ENV_QUEUE_CAPACITY) {
            config.queue.capacity = parse(ENV_QUEUE_CAPACITY, &value)?;
            if config.queue.capacity == 0 {
                return Err(VerifierError::config(ENV_QUEUE_CAPACITY, "must be at least 1"));
            }
        }
        if let Some(value) = get(ENV_OVERFLOW) {
            config.queue.overflow = value
                .parse::<OverflowPolicy>()
                .map_err(|reason| VerifierError::config(ENV_OVERFLOW, reason))?;
        }

        if let Some(value) = get(ENV_MAX_HOPS) {
            // 0 turns the hop budget off.
            config.retention.max_hops = match parse::<usize>(ENV_MAX_HOPS, &value)? {
                0 => None,
                n => Some(n),
            };
        }
        if let Some(value) = get(ENV_MAX_REPORTS_PER_HOP) {
            config.retention.max_reports_per_hop = parse(ENV_MAX_REPORTS_PER_HOP, &value)?;
        }
        if let Some(value) = get(ENV_RETENTION_SECS) {
            let secs: f64 = parse(ENV_RETENTION_SECS, &value)?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(VerifierError::config(
                    ENV_RETENTION_SECS,
                    "must be a positive number of seconds",
                ));
            }
            config.retention.window = Some(secs);
        }

        if let Some(path) = get(ENV_RECORD_DB) {
            config.recorder = Some(RecorderConfig {
                path: PathBuf::from(path),
                ..RecorderConfig::default()
            });
        }
        if let Some(value) = get(ENV_RECORD_BATCH) {
            let batch_size: usize = parse(ENV_RECORD_BATCH, &value)?;
            if batch_size == 0 {
                return Err(VerifierError::config(ENV_RECORD_BATCH, "must be at least 1"));
            }
            match config.recorder.as_mut() {
                Some(recorder) => recorder.batch_size = batch_size,
                None => warn!(
                    "{} is set but {} is not; recording stays disabled",
                    ENV_RECORD_BATCH,
                    ENV_RECORD_DB
                ),
            }
        }

        if let Some(value) = get(ENV_EMIT_JSON) {
            config.emit_json = parse_bool(ENV_EMIT_JSON, &value)?;
        }

        Ok(config)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| VerifierError::config(key, format!("'{}': {}", value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(VerifierError::config(
            key,
            format!("'{}' is not a boolean", other),
        )),
    }
}
