//! Subscriber construction and installation.

use std::env;

use thiserror::Error;
use tracing::*;
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{
    fmt::layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

use super::types::LoggerConfig;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file: {0}")]
    FileAppender(#[from] InitError),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

fn env_filter(config: &LoggerConfig) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(Level::INFO.into());
    match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) if !env.is_empty() => builder.parse_lossy(env),
        _ => builder.parse_lossy(config.filter.as_deref().unwrap_or_default()),
    }
}

/// Builds a subscriber from the config without installing it.
///
/// Useful for scoping logs to one component with
/// [`tracing::subscriber::with_default`].
pub fn build_subscriber(
    config: &LoggerConfig,
) -> Result<impl Subscriber + Send + Sync + 'static, LoggingError> {
    let filt = env_filter(config);

    let stdout_sub = if config.stdout_config.json_format {
        layer()
            .json()
            .with_span_events(config.stdout_config.fmt_span.clone())
            .with_filter(filt.clone())
            .boxed()
    } else {
        layer()
            .compact()
            .with_span_events(config.stdout_config.fmt_span.clone())
            .with_filter(filt.clone())
            .boxed()
    };

    let file_layer = match config.file_logging_config.as_ref() {
        Some(file_config) => {
            let appender = RollingFileAppender::builder()
                .rotation(file_config.rotation.clone())
                .filename_prefix(&file_config.file_name_prefix)
                .filename_suffix("log")
                .build(&file_config.directory)?;

            let layer = if file_config.json_format {
                layer()
                    .json()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_filter(filt)
                    .boxed()
            } else {
                layer()
                    .compact()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_filter(filt)
                    .boxed()
            };
            Some(layer)
        }
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(stdout_sub)
        .with(file_layer))
}

/// Installs the configured subscriber as the process default.
///
/// Meant to be called once by the embedding process; library code only emits
/// events.
pub fn init(config: LoggerConfig) -> Result<(), LoggingError> {
    build_subscriber(&config)?.try_init()?;

    info!(
        service_name = %config.service_name,
        json = config.stdout_config.json_format,
        file_logging = config.file_logging_config.is_some(),
        "logging initialized"
    );
    Ok(())
}
