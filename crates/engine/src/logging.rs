// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The core's own logging sink, installed by [`MediaCore::init`](crate::MediaCore::init)
//! when [`LogConfig::install`] is set.

use mediacore_core::{LogConfig, LogFormat, MediaCoreError, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type DynLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn env_filter_or_level(default_level: tracing::Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_str()))
}

fn make_console_layer(console_level: tracing::Level) -> DynLayer {
    tracing_subscriber::fmt::layer().with_filter(env_filter_or_level(console_level)).boxed()
}

fn make_file_layer(
    non_blocking: NonBlocking,
    file_level: tracing::Level,
    file_format: LogFormat,
) -> DynLayer {
    match file_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .json()
            .with_filter(env_filter_or_level(file_level))
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(env_filter_or_level(file_level))
            .boxed(),
    }
}

fn setup_file_appender(log_config: &LogConfig) -> Result<(NonBlocking, WorkerGuard)> {
    let log_path = std::path::Path::new(&log_config.file_path);
    let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let log_dir = if log_dir.as_os_str().is_empty() { std::path::Path::new(".") } else { log_dir };
    let log_filename =
        log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("mediacore.log"));

    std::fs::create_dir_all(log_dir).map_err(|e| {
        MediaCoreError::InitError(format!(
            "failed to create log directory {}: {e}",
            log_dir.display()
        ))
    })?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_filename);
    Ok(tracing_appender::non_blocking(file_appender))
}

/// Installs console and/or file logging as the global `tracing` subscriber.
///
/// Returns the file writer's guard; keep it alive for as long as file logging should
/// flush. If the process already has a global subscriber this is a no-op returning
/// `Ok(None)`.
///
/// # Errors
///
/// `InitError` if file logging is enabled and the log directory cannot be created.
pub fn init_logging(log_config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let mut guard = None;
    let mut layers: Vec<DynLayer> = Vec::new();

    if log_config.file_enable {
        let (non_blocking, file_guard) = setup_file_appender(log_config)?;
        guard = Some(file_guard);
        layers.push(make_file_layer(non_blocking, log_config.file_level.into(), log_config.file_format));
    }

    if log_config.console_enable {
        layers.push(make_console_layer(log_config.console_level.into()));
    }

    if !log_config.console_enable && !log_config.file_enable {
        layers.push(make_console_layer(tracing::Level::INFO));
    }

    if let Err(e) = tracing_subscriber::registry().with(layers).try_init() {
        tracing::debug!(error = %e, "Global subscriber already installed, keeping it");
        return Ok(None);
    }

    if !log_config.console_enable && !log_config.file_enable {
        tracing::warn!("Both console and file logging are disabled, falling back to console logging");
    }
    tracing::info!(
        console = log_config.console_enable,
        file = log_config.file_enable,
        "MediaCore logging initialised"
    );

    Ok(guard)
}
