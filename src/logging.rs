//! # Structured Logging
//!
//! One subscriber per process. The level comes from `RUST_LOG` when set,
//! otherwise from the deployment environment (`REELFORGE_ENV`). The output
//! format is human-readable by default and JSON lines when
//! `REELFORGE_LOG_FORMAT=json`.
//!
//! The `log_*` helpers give scheduler and facade log lines a fixed field set
//! (`job_id`, `task_id`, `kind`, `attempt`) so runs can be followed by job in
//! aggregated logs.

use crate::models::Task;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("REELFORGE_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Default filter directive for a deployment environment
fn default_directive(environment: &str) -> &'static str {
    match environment {
        "production" => "info,sqlx=warn",
        "test" => "reelforge_core=debug,sqlx=warn",
        _ => "reelforge_core=debug,info",
    }
}

fn environment() -> String {
    std::env::var("REELFORGE_ENV").unwrap_or_else(|_| "development".to_string())
}

/// Install the global subscriber. Safe to call repeatedly; a subscriber
/// already installed by the embedding application is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = environment();
        let format = LogFormat::from_env();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(&environment)));

        let layer = match format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_filter(filter)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_filter(filter)
                .boxed(),
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Tracing subscriber already installed, keeping it");
        }

        tracing::info!(
            environment = %environment,
            format = ?format,
            "📋 Logging initialized"
        );
    });
}

/// One scheduler action on a task, logged with the task's current state
pub fn log_task_operation(operation: &str, task: &Task, details: Option<&str>) {
    tracing::info!(
        operation,
        job_id = %task.job_id,
        task_id = %task.id,
        kind = %task.kind,
        status = %task.status,
        attempt = task.attempt_count,
        details,
        "🎞️ task {operation}"
    );
}

/// One facade or fan-out action on a whole run
pub fn log_run_operation(operation: &str, job_id: &str, status: &str, details: Option<&str>) {
    tracing::info!(operation, job_id, status, details, "🎬 run {operation}");
}

/// Failure inside the orchestrator itself, as opposed to a task failure
/// recorded through the store
pub fn log_error(component: &str, operation: &str, error: &str, subject: Option<&str>) {
    tracing::error!(component, operation, error, subject, "❌ {component} {operation} failed");
}
