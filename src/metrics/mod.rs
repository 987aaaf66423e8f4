use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream},
    KeyValue,
};
use prometheus::{default_registry, Encoder, TextEncoder};

use crate::errors::{HeadError, HeadResult};

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
///
/// Instruments created before this is called record into a no-op
/// provider.
pub fn initialize_metrics() -> HeadResult<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("data_head")
        .build()
        .map_err(|err| HeadError::Metrics(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
                        0.5, 1.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| HeadError::Metrics(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Render everything in the default Prometheus registry in the text
/// exposition format.
pub fn render_metrics() -> HeadResult<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    encoder
        .encode(&families, &mut buf)
        .map_err(|err| HeadError::Metrics(err.to_string()))?;
    Ok((encoder.format_type().to_owned(), buf))
}

/// Instruments updated on every progress report.
#[derive(Clone)]
pub(crate) struct IngestMetrics {
    pub(crate) received: Counter<u64>,
    pub(crate) rejected: Counter<u64>,
    pub(crate) stale: Counter<u64>,
    pub(crate) ingest_histogram: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl IngestMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("data_head");
        Self {
            received: meter
                .u64_counter("snapshots_received")
                .with_description("number of progress reports received from workers")
                .init(),
            rejected: meter
                .u64_counter("snapshots_rejected")
                .with_description("number of progress reports that failed validation")
                .init(),
            stale: meter
                .u64_counter("snapshots_stale")
                .with_description("number of progress reports dropped as out of date")
                .init(),
            ingest_histogram: meter
                .f64_histogram("snapshot_ingest_duration_seconds")
                .with_description("time spent merging one progress report")
                .init(),
            labels: vec![KeyValue::new("port", "ingest")],
        }
    }
}

/// Instruments tracking dataset lifecycle in the registry.
#[derive(Clone)]
pub(crate) struct RegistryMetrics {
    pub(crate) datasets_created: Counter<u64>,
    pub(crate) datasets_evicted: Counter<u64>,
}

impl RegistryMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("data_head");
        Self {
            datasets_created: meter
                .u64_counter("datasets_created")
                .with_description("number of dataset executions first seen")
                .init(),
            datasets_evicted: meter
                .u64_counter("datasets_evicted")
                .with_description("number of finished dataset executions dropped by retention")
                .init(),
        }
    }
}
