//! Logging and trace export.
//!
//! Logs always go to stdout at the configured level. Traces are only
//! exported when an OTLP collector is configured.
//!
//! The OTLP exporter runs its batch processor on the ambient tokio
//! runtime, so [`setup_tracing`] has to be called from inside one.
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{
    filter::Targets, layer::SubscriberExt, registry::LookupSpan, EnvFilter, Layer, Registry,
};

use crate::errors::{HeadError, HeadResult};

pub(crate) mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

const TARGET: &str = "data_head";

#[derive(Debug, Clone, PartialEq)]
pub struct TracingConfig {
    pub log_level: LevelFilter,
    pub otlp: Option<OtlpTracingConfig>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::INFO,
            otlp: None,
        }
    }
}

pub fn parse_log_level(level: &str) -> HeadResult<LevelFilter> {
    match level.to_lowercase().as_str() {
        "off" => Ok(LevelFilter::OFF),
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        level => Err(HeadError::Config(format!("wrong log level: {level}"))),
    }
}

fn log_layer<S>(level: LevelFilter) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        .with_filter(Targets::new().with_target(TARGET, level))
}

/// Install the global subscriber.
pub fn setup_tracing(config: &TracingConfig) -> HeadResult<()> {
    let logs = log_layer(config.log_level);

    if let Some(otlp) = &config.otlp {
        let tracer = otlp.build()?;
        let telemetry = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            // Send everything from this crate, and errors from anywhere.
            .with_filter(EnvFilter::new(format!("{TARGET}=trace,error")));
        set_global_subscriber(Registry::default().with(logs).with(telemetry));
    } else {
        set_global_subscriber(Registry::default().with(logs));
    }
    Ok(())
}

/// Flush pending spans. Call before the process exits.
pub fn shutdown_tracing(config: &TracingConfig) {
    if config.otlp.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

// Try to set the global default subscriber, logging the error
// without failing if one was already set.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This fails if tracing was already initialized, which happens
    // when the service is embedded in a process that set up its own.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}
