//! Tracing subscriber and OpenTelemetry export.
//!
//! Log lines always go to stderr so the JSON replies on stdout stay
//! machine-readable. With an OTLP endpoint, spans and the `crowdclaim.*`
//! metrics are exported there as well.

pub mod metrics;
pub mod work;

use crate::error::{Error, Result};
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Where and how the process reports.
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317".
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl TelemetryConfig {
    /// Stderr-only logging at the given level.
    pub fn local(service_name: impl Into<String>, log_level: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            log_level: log_level.into(),
        }
    }
}

/// Span and metric providers for one OTLP endpoint.
struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
}

impl Exporters {
    fn connect(endpoint: &str, service_name: String) -> Result<Self> {
        let resource = Resource::builder()
            .with_service_name(service_name)
            .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
            .build();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| Error::Other(format!("OTLP span exporter for {endpoint}: {e}")))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| Error::Other(format!("OTLP metric exporter for {endpoint}: {e}")))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource)
                .build(),
        })
    }
}

/// Keeps the export pipelines alive. Dropping it flushes and shuts them
/// down, so hold it until the command has printed its reply.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Push buffered spans and metrics out now.
    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            let _ = exporters.tracer.force_flush();
            let _ = exporters.meter.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            let _ = exporters.meter.shutdown();
            let _ = exporters.tracer.shutdown();
        }
    }
}

/// Install the global subscriber, plus the OTLP span layer and meter
/// provider when `config.endpoint` is set.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let stderr = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    let exporters = config
        .endpoint
        .as_deref()
        .map(|endpoint| Exporters::connect(endpoint, config.service_name))
        .transpose()?;

    let spans = exporters.as_ref().map(|e| {
        tracing_opentelemetry::layer().with_tracer(e.tracer.tracer("crowdclaim"))
    });
    if let Some(e) = &exporters {
        opentelemetry::global::set_meter_provider(e.meter.clone());
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(spans)
        .try_init()
        .map_err(|e| Error::Other(format!("tracing subscriber already set: {e}")))?;

    Ok(TelemetryGuard { exporters })
}
