//! # Telemetry Features
//!
//! Structured logs are always written through `tracing-subscriber`. On top of
//! that, the authority can export OpenTelemetry spans and metrics.
//!
//! ## Feature matrix
//!
//! - `traces`: Exports `tracing` spans through OpenTelemetry.
//! - `metrics`: Exports OpenTelemetry counters and histograms.
//! - `otlp`: Enables the OTLP gRPC exporter. The collector endpoint is read
//!   from `OTEL_EXPORTER_OTLP_ENDPOINT`.
//! - `stdout`: Enables the stdout exporter.
//!
//! ## Feature constraints
//!
//! - Exporters require using at least one of: `traces` or `metrics`.
//! - Both `otlp` and `stdout` exporters can be enabled at the same time.
//!
//! ## Metrics
//!
//! - `xids_granted`: ids handed to nodes, batch grants and singles alike
//! - `xids_finished`: finishes recorded by the authority
//! - `stale_completions`: finishes for ids that were not outstanding
//! - `subscribers_streaming`: subscribers currently receiving deltas
//! - `subscriber_drops`: subscriber connections closed by an error
//! - `fanout_bytes`: bytes serialized per broadcast batch
//!
//! ## Example usage
//!
//! Export spans and metrics to a local collector:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 \
//!   cargo run -p xidgate-server --features traces,metrics,otlp
//! ```
//!
//! Print metrics to stdout:
//!
//! ```bash
//! cargo run -p xidgate-server --features metrics,stdout
//! ```

// Disallow using `otlp` without `traces` or `metrics`
#[cfg(all(feature = "otlp", not(any(feature = "traces", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'traces' or 'metrics' to be enabled.");

// Disallow using `stdout` without `traces` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "traces", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'traces' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "traces")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "otlp", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "traces")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "traces")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "traces")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "traces")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Failures go to stderr since the
    /// log pipeline may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "traces")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "traces")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "traces")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "traces"))]
    let scope = InstrumentationScope::builder("xidgate")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Console logs are always on, independent of the stdout exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "traces")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "traces")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "otlp")]
fn otlp_endpoint() -> anyhow::Result<String> {
    use anyhow::Context;
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").context("missing `OTEL_EXPORTER_OTLP_ENDPOINT`")
}

#[cfg(any(feature = "metrics", feature = "traces"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("xidgate")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(Compression::Gzip)
            .with_endpoint(otlp_endpoint()?)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "traces")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(Compression::Gzip)
            .with_endpoint(otlp_endpoint()?)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;

        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();

        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static XIDS_GRANTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static XIDS_FINISHED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STALE_COMPLETIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SUBSCRIBERS_STREAMING: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SUBSCRIBER_DROPS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static FANOUT_BYTES: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = XIDS_GRANTED.set(
        meter
            .u64_counter("xids_granted")
            .with_description("Transaction ids handed to nodes")
            .build(),
    );

    let _ = XIDS_FINISHED.set(
        meter
            .u64_counter("xids_finished")
            .with_description("Transaction ids reported finished")
            .build(),
    );

    let _ = STALE_COMPLETIONS.set(
        meter
            .u64_counter("stale_completions")
            .with_description("Finishes for ids that were not outstanding")
            .build(),
    );

    let _ = SUBSCRIBERS_STREAMING.set(
        meter
            .i64_up_down_counter("subscribers_streaming")
            .with_description("Subscribers receiving snapshot deltas")
            .build(),
    );

    let _ = SUBSCRIBER_DROPS.set(
        meter
            .u64_counter("subscriber_drops")
            .with_description("Subscriber connections closed by an error")
            .build(),
    );

    let _ = FANOUT_BYTES.set(
        meter
            .f64_histogram("fanout_bytes")
            .with_unit("By")
            .with_description("Serialized bytes per broadcast batch")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_xids_granted(count: u64) {
    if let Some(counter) = XIDS_GRANTED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_xids_granted(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_xids_finished() {
    if let Some(counter) = XIDS_FINISHED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_xids_finished() {}

#[cfg(feature = "metrics")]
pub fn increment_stale_completions() {
    if let Some(counter) = STALE_COMPLETIONS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_stale_completions() {}

#[cfg(feature = "metrics")]
pub fn increment_subscribers_streaming() {
    if let Some(counter) = SUBSCRIBERS_STREAMING.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_subscribers_streaming() {}

#[cfg(feature = "metrics")]
pub fn decrement_subscribers_streaming() {
    if let Some(counter) = SUBSCRIBERS_STREAMING.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_subscribers_streaming() {}

#[cfg(feature = "metrics")]
pub fn increment_subscriber_drops() {
    if let Some(counter) = SUBSCRIBER_DROPS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_subscriber_drops() {}

#[cfg(feature = "metrics")]
pub fn record_fanout_bytes(bytes: f64) {
    if let Some(histogram) = FANOUT_BYTES.get() {
        histogram.record(bytes, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_fanout_bytes(_bytes: f64) {}
