//! Log routing. Events go to up to three sinks by severity: info and warn
//! to the normal log, error to the error log, and protocol-level debug
//! detail to the debug log when enabled. Each sink is a bounded
//! non-blocking queue in lossless mode, so a slow disk backpressures
//! loggers instead of dropping events; the returned guards drain the
//! queues when the supervisor lets them go.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

#[derive(Debug, Default, Clone)]
pub struct LogConfig {
    pub debug: bool,
    pub normal_log: Option<PathBuf>,
    pub debug_log: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
}

/// Keeps the sink worker threads alive. Drop order: last thing the
/// process releases, after every task that might still log has finished.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

pub fn init(config: &LogConfig) -> Result<LogGuards> {
    let mut guards = Vec::new();

    let normal = sink(config.normal_log.as_deref(), io::stdout, &mut guards)?;
    let normal_layer = fmt::layer()
        .with_writer(normal)
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter_fn(|metadata| {
            let level = *metadata.level();
            level == Level::INFO || level == Level::WARN
        }));

    let error = sink(config.error_log.as_deref(), io::stderr, &mut guards)?;
    let error_layer = fmt::layer()
        .with_writer(error)
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter_fn(|metadata| *metadata.level() == Level::ERROR));

    let debug_layer = if config.debug {
        let debug = sink(config.debug_log.as_deref(), io::stderr, &mut guards)?;
        Some(
            fmt::layer()
                .with_writer(debug)
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter_fn(|metadata| {
                    let level = *metadata.level();
                    level == Level::DEBUG || level == Level::TRACE
                })),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(normal_layer)
        .with(error_layer)
        .with(debug_layer)
        .try_init()
        .context("logging was already initialized")?;

    Ok(LogGuards { _guards: guards })
}

/// One sink: the given file in append mode, or the fallback stream.
fn sink<W>(
    path: Option<&Path>,
    fallback: impl FnOnce() -> W,
    guards: &mut Vec<WorkerGuard>,
) -> Result<NonBlocking>
where
    W: io::Write + Send + 'static,
{
    let builder = NonBlockingBuilder::default().lossy(false);
    let (writer, guard) = match path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .with_context(|| format!("unable to open log file {}", path.display()))?;
            builder.finish(file)
        }
        None => builder.finish(fallback()),
    };
    guards.push(guard);
    Ok(writer)
}
