//! Tracing initialization. JSON output for production, human-readable for
//! development, selected by `LOG_FORMAT`.

use anyhow::Result;
use idearoom_core::config::{LogFormat, ObservabilityConfig};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let format_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_target(true)
            .with_file(true)
            .flatten_event(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    Registry::default()
        .with(env_filter)
        .with(format_layer)
        .try_init()?;

    Ok(())
}
