//! # Telemetry
//!
//! Console logging is always on. OpenTelemetry export is opt-in through cargo
//! features.
//!
//! ## Feature matrix
//!
//! - `tracing`: spans and events from this crate and from `muxpool`.
//! - `metrics`: the `muxpool.*` pool counters and, on servers built with
//!   `enable_metrics`, the `rpc.server.*` instruments.
//! - `stdout`: export to stdout.
//! - `otlp`: export over OTLP/gRPC. The collector address comes from the
//!   standard `OTEL_EXPORTER_OTLP_ENDPOINT` variable.
//!
//! Exporters require at least one of `tracing` or `metrics`; both exporters
//! may be enabled together.
//!
//! ```bash
//! cargo run --bin muxpool-server --features tracing,metrics,otlp
//! RUST_LOG=muxpool=debug cargo run --bin muxpool-check --features tracing -- --endpoint 127.0.0.1:50051
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'tracing' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use core::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(feature = "otlp")]
use opentelemetry_otlp::{Protocol, WithExportConfig};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::{Resource, error::OTelSdkResult};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semconv;

#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics::SdkMeterProvider;
#[cfg(all(feature = "metrics", any(feature = "stdout", feature = "otlp")))]
use opentelemetry_sdk::metrics::PeriodicReader;
#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::SdkTracerProvider};
#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "otlp")))]
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SpanExporter};

/// Filter used when `RUST_LOG` is unset or invalid.
const DEFAULT_FILTER: &str = "info";

/// Knobs shared by every export pipeline.
#[derive(Debug, Clone, Copy)]
pub struct TelemetrySettings {
    /// Reported as `service.name` on every exported signal.
    pub service_name: &'static str,
    /// How often batched spans are flushed and metrics are read.
    pub export_interval: Duration,
    /// Deadline for each OTLP export request.
    pub export_timeout: Duration,
}

impl TelemetrySettings {
    pub const fn new(service_name: &'static str) -> Self {
        Self {
            service_name,
            export_interval: Duration::from_secs(5),
            export_timeout: Duration::from_secs(10),
        }
    }
}

/// Providers that hold buffered telemetry. Call
/// [`TelemetryProviders::shutdown`] before exiting or the tail is lost.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: SdkMeterProvider,
}

/// [`init_telemetry_with`] using default export settings.
pub fn init_telemetry(service_name: &'static str) -> anyhow::Result<TelemetryProviders> {
    init_telemetry_with(TelemetrySettings::new(service_name))
}

/// Installs the global subscriber and, depending on features, the
/// OpenTelemetry providers. With `metrics`, the pool instruments are
/// registered on the new meter.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry_with(_settings: TelemetrySettings) -> anyhow::Result<TelemetryProviders> {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_thread_ids(true)
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        );

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("muxpool")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semconv::SCHEMA_URL)
        .build();

    #[cfg(feature = "tracing")]
    let (registry, tracer_provider) = {
        let provider = build_tracer_provider(&_settings)?;
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        opentelemetry::global::set_tracer_provider(provider.clone());
        let layer = tracing_opentelemetry::layer()
            .with_tracer(provider.tracer_with_scope(scope.clone()))
            .with_error_records_to_exceptions(true);
        (registry.with(layer), provider)
    };

    #[cfg(feature = "metrics")]
    let (registry, meter_provider) = {
        let provider = build_meter_provider(&_settings)?;
        opentelemetry::global::set_meter_provider(provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        muxpool::metrics::init(&meter);
        crate::metrics::init(&meter);
        let layer = tracing_opentelemetry::MetricsLayer::new(provider.clone());
        (registry.with(layer), provider)
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

impl TelemetryProviders {
    /// Flushes and shuts down every provider. Failures are printed, not
    /// returned: the process is exiting either way.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        {
            report("flushing traces", self.tracer_provider.force_flush());
            report("shutting down tracer", self.tracer_provider.shutdown());
        }

        #[cfg(feature = "metrics")]
        {
            report("flushing metrics", self.meter_provider.force_flush());
            report("shutting down meter", self.meter_provider.shutdown());
        }
    }
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn report(action: &str, result: OTelSdkResult) {
    if let Err(err) = result {
        // The subscriber may already be gone.
        eprintln!("Error {action}: {err:#?}");
    }
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource(settings: &TelemetrySettings) -> Resource {
    Resource::builder()
        .with_service_name(settings.service_name)
        .with_schema_url(
            [KeyValue::new(
                semconv::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semconv::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
#[allow(unused_mut)]
fn build_meter_provider(settings: &TelemetrySettings) -> anyhow::Result<SdkMeterProvider> {
    let mut builder = SdkMeterProvider::builder().with_resource(resource(settings));

    #[cfg(feature = "stdout")]
    {
        let reader = PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(settings.export_interval)
            .build();
        builder = builder.with_reader(reader);
    }

    #[cfg(feature = "otlp")]
    {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_protocol(Protocol::Grpc)
            .with_timeout(settings.export_timeout)
            .build()
            .context("failed to build OTLP metric exporter")?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(settings.export_interval)
            .build();
        builder = builder.with_reader(reader);
    }

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
#[allow(unused_mut)]
fn build_tracer_provider(settings: &TelemetrySettings) -> anyhow::Result<SdkTracerProvider> {
    let mut builder = SdkTracerProvider::builder().with_resource(resource(settings));

    #[cfg(feature = "stdout")]
    {
        let exporter = opentelemetry_stdout::SpanExporter::default();
        builder = builder.with_span_processor(batched(exporter, settings));
    }

    #[cfg(feature = "otlp")]
    {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_protocol(Protocol::Grpc)
            .with_timeout(settings.export_timeout)
            .build()
            .context("failed to build OTLP span exporter")?;
        builder = builder.with_span_processor(batched(exporter, settings));
    }

    Ok(builder.build())
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "otlp")))]
fn batched<E>(exporter: E, settings: &TelemetrySettings) -> BatchSpanProcessor
where
    E: SpanExporter + 'static,
{
    let config = BatchConfigBuilder::default()
        .with_scheduled_delay(settings.export_interval)
        .with_max_queue_size(2048)
        .build();
    BatchSpanProcessor::builder(exporter)
        .with_batch_config(config)
        .build()
}
