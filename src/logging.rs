use std::{path::Path, sync::OnceLock};

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the tracing subscriber: env-filtered stdout plus, when a log
/// directory is given, a non-blocking daily-rotated file. Safe to call more
/// than once; later calls are no-ops.
pub fn init(log_dir: Option<&Path>) -> Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "rosterdbx.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer);
            if subscriber.try_init().is_ok() {
                let _ = FILE_GUARD.set(guard);
            } else {
                // Subscriber already installed elsewhere; drop the guard so
                // the worker thread exits.
                drop(guard);
            }
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer);
            let _ = subscriber.try_init();
        }
    }

    Ok(())
}
