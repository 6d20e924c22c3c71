//! ---
//! mqb_section: "05-observability"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Process-wide tracing subscriber installation."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter directive override, consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "MQBRIDGE_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

static GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

/// Console rendering for the stderr layer. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Resolve the filter from `MQBRIDGE_LOG`, then `RUST_LOG`, then `info`.
pub fn resolve_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive {directive:?} ({err}); using {DEFAULT_DIRECTIVE}");
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        Err(_) => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

/// Path of the rolling log file prefix for `service_name`.
pub fn log_file_prefix(service_name: &str, config: &LoggingConfig) -> PathBuf {
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    PathBuf::from(format!("{prefix}-{service_name}.log"))
}

/// Install the global subscriber: a console layer on stderr plus a daily
/// JSON file under `config.directory`.
///
/// Stdout is left to command output. Calling this twice keeps the first
/// subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!(
            "unable to create log directory {}",
            config.directory.display()
        )
    })?;

    let appender = daily(&config.directory, log_file_prefix(service_name, config));
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (console_writer, console_guard) = tracing_appender::non_blocking(std::io::stderr());

    let console_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(console_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(console_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(resolve_filter())
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        let _ = GUARDS.set((file_guard, console_guard));
        info!(
            service = %service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            "tracing initialised"
        );
    }
    Ok(())
}
