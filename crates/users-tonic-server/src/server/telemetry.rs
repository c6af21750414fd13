//! Logging, tracing and metrics setup.
//!
//! Console logging through `tracing_subscriber::fmt` is always on, filtered by
//! `RUST_LOG` (default `info`) and rendered either human-readable or as JSON
//! lines. Everything else is opt-in through cargo features:
//!
//! | feature     | effect                                                    |
//! |-------------|-----------------------------------------------------------|
//! | `tracing`   | RPC spans exported through `tracing-opentelemetry`        |
//! | `metrics`   | request/stream counters exported as OpenTelemetry metrics |
//! | `stdout`    | print exported spans/metrics to stdout                    |
//! | `honeycomb` | ship exported spans/metrics to Honeycomb over OTLP/gRPC   |
//!
//! An exporter without `tracing` or `metrics` has nothing to export and is
//! rejected at compile time.
//!
//! Only events emitted inside a span reach the exporters; events outside a
//! span are console-only.
//!
//! ```bash
//! cargo run --features tracing,metrics,stdout
//! HONEYCOMB_API_KEY=.. HONEYCOMB_DATASET=users HONEYCOMB_ENDPOINT=https://api.honeycomb.io \
//!   HONEYCOMB_COMPRESSION=zstd cargo run --features tracing,honeycomb
//! ```

#[cfg(all(
    any(feature = "honeycomb", feature = "stdout"),
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!("exporter features need `tracing` or `metrics` to have anything to export");

use crate::server::config::LogFormat;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::metadata::MetadataMap;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use tonic::transport::ClientTlsConfig;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

#[cfg(any(feature = "metrics", feature = "tracing"))]
const SERVICE_NAME: &str = "users-tonic-server";

#[cfg(any(feature = "metrics", feature = "tracing"))]
const EXPORT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Exporter providers that must be flushed and shut down on exit.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes pending spans and metrics, then shuts the providers down.
    /// Failures are printed to stderr since the subscriber may already be
    /// gone.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {:#?}", err);
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {:#?}", err);
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {:#?}", err);
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {:#?}", err);
            }
        }
    }
}

pub fn init_telemetry(log_format: LogFormat) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("users")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let console = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_line_number(true)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_file(true);
    let console = match log_format {
        LogFormat::Pretty => console.pretty().boxed(),
        LogFormat::Json => console.json().boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(console);

    #[cfg(feature = "tracing")]
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
        let _ = INSTRUMENTS.set(Instruments::register(&meter));

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

/// Connection settings for the Honeycomb OTLP endpoint, read from the
/// environment.
#[cfg(feature = "honeycomb")]
struct Honeycomb {
    metadata: MetadataMap,
    endpoint: String,
    compression: Compression,
}

#[cfg(feature = "honeycomb")]
impl Honeycomb {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        fn var(name: &str) -> anyhow::Result<String> {
            std::env::var(name).with_context(|| format!("missing `{name}`"))
        }

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?
                .parse()
                .context("invalid API key")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?
                .parse()
                .context("invalid dataset")?,
        );

        let compression =
            Compression::from_str(&var("HONEYCOMB_COMPRESSION")?.to_ascii_lowercase())?;

        Ok(Self {
            metadata,
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression,
        })
    }
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
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
        let reader =
            sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
                .with_interval(EXPORT_INTERVAL)
                .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let hc = Honeycomb::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(hc.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(hc.compression)
            .with_endpoint(hc.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn batch_config() -> sdktrace::BatchConfig {
    sdktrace::BatchConfigBuilder::default()
        .with_scheduled_delay(EXPORT_INTERVAL)
        .with_max_queue_size(2048)
        .build()
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let batch =
            sdktrace::BatchSpanProcessor::builder(opentelemetry_stdout::SpanExporter::default())
                .with_batch_config(batch_config())
                .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let hc = Honeycomb::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(hc.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(hc.compression)
            .with_endpoint(hc.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;

        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(batch_config())
            .build();
        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

/// Instruments behind the metric helpers below. Set once by
/// [`init_telemetry`]; until then every helper is a no-op.
#[cfg(feature = "metrics")]
struct Instruments {
    requests: Counter<u64>,
    request_errors: Counter<u64>,
    users_created: Counter<u64>,
    users_streamed: Counter<u64>,
    streams_inflight: UpDownCounter<i64>,
    stream_duration_ms: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

#[cfg(feature = "metrics")]
impl Instruments {
    fn register(meter: &Meter) -> Self {
        Self {
            requests: meter
                .u64_counter("requests")
                .with_description("Total gRPC requests, by method")
                .build(),
            request_errors: meter
                .u64_counter("request_errors")
                .with_description("Failed requests and aborted streams, by method")
                .build(),
            users_created: meter
                .u64_counter("users_created")
                .with_description("Users inserted into the store")
                .build(),
            users_streamed: meter
                .u64_counter("users_streamed")
                .with_description("Users delivered over StreamUsers")
                .build(),
            streams_inflight: meter
                .i64_up_down_counter("streams_inflight")
                .with_description("Concurrent StreamUsers calls")
                .build(),
            stream_duration_ms: meter
                .f64_histogram("stream_duration")
                .with_unit("ms")
                .with_description("End-to-end StreamUsers duration")
                .build(),
        }
    }
}

#[cfg(feature = "metrics")]
fn record(f: impl FnOnce(&Instruments)) {
    if let Some(instruments) = INSTRUMENTS.get() {
        f(instruments);
    }
}

pub fn increment_requests(_method: &'static str) {
    #[cfg(feature = "metrics")]
    record(|m| m.requests.add(1, &[KeyValue::new("method", _method)]));
}

pub fn increment_request_errors(_method: &'static str) {
    #[cfg(feature = "metrics")]
    record(|m| m.request_errors.add(1, &[KeyValue::new("method", _method)]));
}

pub fn increment_users_created() {
    #[cfg(feature = "metrics")]
    record(|m| m.users_created.add(1, &[]));
}

pub fn increment_users_streamed(_count: u64) {
    #[cfg(feature = "metrics")]
    record(|m| m.users_streamed.add(_count, &[]));
}

pub fn increment_streams_inflight() {
    #[cfg(feature = "metrics")]
    record(|m| m.streams_inflight.add(1, &[]));
}

pub fn decrement_streams_inflight() {
    #[cfg(feature = "metrics")]
    record(|m| m.streams_inflight.add(-1, &[]));
}

pub fn record_stream_duration(_duration_ms: f64) {
    #[cfg(feature = "metrics")]
    record(|m| m.stream_duration_ms.record(_duration_ms, &[]));
}
