//! Structured logging setup and in-process counters.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable multi-line output with all fields
    Pretty,
    /// One line per event: timestamp level target fields message
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{other}' (expected compact, pretty or json)")),
        }
    }
}

/// Logging configuration.
///
/// `RUST_LOG` takes precedence over `log_level` when set. Every record emitted
/// by the engine carries correlation fields such as `instance_id`,
/// `orchestration_name`, `activity_name`, `activity_id` and `worker_id`.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level for the engine's own targets (e.g. "info", "debug").
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,ordo={level},ordo::orchestration={level},ordo::activity={level}")
}

/// Install the global `tracing` subscriber. Fails if one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("failed to initialize compact logging: {e}")),
    }
}

/// Snapshot of runtime counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub orch_turns: u64,
    pub orch_completions: u64,
    pub orch_failures: u64,
    pub activity_success: u64,
    pub activity_failures: u64,
    pub activity_retries: u64,
    pub duplicate_completions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RuntimeMetrics {
    orch_turns: AtomicU64,
    orch_completions: AtomicU64,
    orch_failures: AtomicU64,
    activity_success: AtomicU64,
    activity_failures: AtomicU64,
    activity_retries: AtomicU64,
    duplicate_completions: AtomicU64,
}

impl RuntimeMetrics {
    pub(crate) fn record_turn(&self) {
        self.orch_turns.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_orch_completion(&self) {
        self.orch_completions.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_orch_failure(&self) {
        self.orch_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_activity_success(&self) {
        self.activity_success.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_activity_failure(&self) {
        self.activity_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_activity_retry(&self) {
        self.activity_retries.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_duplicates(&self, n: u64) {
        self.duplicate_completions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            orch_turns: self.orch_turns.load(Ordering::Relaxed),
            orch_completions: self.orch_completions.load(Ordering::Relaxed),
            orch_failures: self.orch_failures.load(Ordering::Relaxed),
            activity_success: self.activity_success.load(Ordering::Relaxed),
            activity_failures: self.activity_failures.load(Ordering::Relaxed),
            activity_retries: self.activity_retries.load(Ordering::Relaxed),
            duplicate_completions: self.duplicate_completions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("Compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn default_filter_targets_engine_modules() {
        let expr = default_filter_expression("debug");
        assert!(expr.starts_with("warn,"));
        assert!(expr.contains("ordo::orchestration=debug"));
        assert!(expr.contains("ordo::activity=debug"));
    }

    #[test]
    fn counters_accumulate_into_snapshot() {
        let m = RuntimeMetrics::default();
        m.record_turn();
        m.record_turn();
        m.record_activity_success();
        m.record_duplicates(3);
        let snap = m.snapshot();
        assert_eq!(snap.orch_turns, 2);
        assert_eq!(snap.activity_success, 1);
        assert_eq!(snap.duplicate_completions, 3);
        assert_eq!(snap.orch_failures, 0);
    }
}
