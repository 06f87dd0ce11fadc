//! Dual-layer tracing setup: rotating JSON file output plus a compact
//! colored stdout layer, each independently controlled by `RUST_LOG`.
//!
//! # Targets
//! `scheduler`, `uploader`, `uploader::chunk`, `uploader::fingerprint`,
//! `error_center`, `event_bus`, `network`, `storage`, `worker_pool`.
//!
//! ```bash
//! RUST_LOG=scheduler=debug,network=trace cargo run
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub struct LogConfig {
    pub log_dir: PathBuf,
    pub file_prefix: String,
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        let log_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chunkflow")
            .join("logs");

        Self {
            log_dir,
            file_prefix: "chunkflow".to_string(),
            max_files: 5,
        }
    }
}

pub fn init_logging(config: LogConfig) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.log_dir).context("failed to create log directory")?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .max_log_files(config.max_files)
        .build(&config.log_dir)
        .context("failed to create file appender")?;

    let (non_blocking_file, worker_guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(env_filter.clone());

    let stdout_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_ansi(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    tracing::info!(
        target: "chunkflow",
        log_dir = %config.log_dir.display(),
        max_files = config.max_files,
        "logging initialized"
    );

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}

pub struct LogGuard {
    _worker_guard: tracing_appender::non_blocking::WorkerGuard,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        tracing::info!(target: "chunkflow", "flushing logs before shutdown");
    }
}
