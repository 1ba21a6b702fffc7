//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Shared primitives and utilities for the service runtime."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Tracing setup for the daemon: a console layer in the configured format
//! plus a daily-rolling JSON file below the log directory.

use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::{self, time::UtcTime};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Checked before `RUST_LOG`.
pub const LOG_ENV: &str = "WARDEN_LOG";

/// HTTP client internals are chatty at `info`.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn";

/// Console output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Flushes the log file on drop; hold it for the life of the process.
#[must_use = "dropping the guard stops writing the log file"]
#[derive(Debug)]
pub struct TracingGuard {
    _file: WorkerGuard,
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
    let Some(directives) = directives.map(str::trim).filter(|text| !text.is_empty()) else {
        return EnvFilter::new(DEFAULT_DIRECTIVES);
    };
    EnvFilter::try_new(directives).unwrap_or_else(|err| {
        eprintln!("ignoring log filter '{directives}': {err}");
        EnvFilter::new(DEFAULT_DIRECTIVES)
    })
}

/// Install the global subscriber for `service_name`.
///
/// A second call leaves the installed subscriber in place and only opens
/// another file writer.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<TracingGuard> {
    fs::create_dir_all(&config.directory).with_context(|| {
        format!("creating log directory {}", config.directory.display())
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let appender = rolling::daily(&config.directory, format!("{prefix}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let console = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_timer(UtcTime::rfc_3339())
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_thread_ids(false).boxed(),
    };
    let file = fmt::layer()
        .json()
        .flatten_event(true)
        .with_ansi(false)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(file_writer)
        .boxed();

    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok();
    let installed = tracing_subscriber::registry()
        .with(filter_from(directives.as_deref()))
        .with(console)
        .with(file)
        .try_init()
        .is_ok();

    if installed {
        info!(
            service = service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            "tracing initialised"
        );
    } else {
        debug!(service = service_name, "subscriber already installed");
    }
    Ok(TracingGuard { _file: file_guard })
}
