use std::sync::OnceLock;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};

const METER_NAME: &str = "event-forwarder";
const EXPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Install a global OTLP (gRPC) meter provider exporting to `endpoint`.
///
/// Must run before [`forwarder_metrics`] is first called; instruments bind
/// to whichever provider is global at that moment.
pub fn init_otlp_metrics(
    service_name: &str,
    endpoint: &str,
) -> Result<SdkMeterProvider, Box<dyn std::error::Error + Send + Sync>> {
    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.name", service_name.to_string()))
        .build();

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(EXPORT_INTERVAL)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(provider)
}

/// The metrics-specific endpoint wins over the general one; blank values
/// count as unset.
pub fn otlp_metrics_endpoint(
    metrics_endpoint: Option<String>,
    endpoint: Option<String>,
) -> Option<String> {
    metrics_endpoint
        .filter(|v| !v.trim().is_empty())
        .or_else(|| endpoint.filter(|v| !v.trim().is_empty()))
}

/// Install the OTLP exporter only when an endpoint is configured.
/// Env vars:
///  - OTEL_EXPORTER_OTLP_METRICS_ENDPOINT or OTEL_EXPORTER_OTLP_ENDPOINT
///  - OTEL_SERVICE_NAME (optional override)
pub fn init_otlp_metrics_if_configured(
    default_service: &str,
) -> Result<Option<SdkMeterProvider>, Box<dyn std::error::Error + Send + Sync>> {
    let Some(endpoint) = otlp_metrics_endpoint(
        std::env::var("OTEL_EXPORTER_OTLP_METRICS_ENDPOINT").ok(),
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
    ) else {
        return Ok(None);
    };
    let service_name = std::env::var("OTEL_SERVICE_NAME")
        .unwrap_or_else(|_| default_service.to_string());
    init_otlp_metrics(&service_name, &endpoint).map(Some)
}

#[derive(Clone)]
pub struct ForwarderMetrics {
    pub events_processed_total: Counter<u64>,
    pub delivery_errors_total: Counter<u64>,
}

static FORWARDER_METRICS: OnceLock<ForwarderMetrics> = OnceLock::new();

/// Initialize (or fetch existing) forwarder counters on the global meter.
/// Without an exporter installed these are no-ops.
pub fn forwarder_metrics() -> ForwarderMetrics {
    FORWARDER_METRICS
        .get_or_init(|| {
            let meter: Meter = opentelemetry::global::meter(METER_NAME);
            let events_processed_total = meter
                .u64_counter("event_forwarder.events.processed.total")
                .with_description("Events processed, by outcome")
                .build();
            let delivery_errors_total = meter
                .u64_counter("event_forwarder.delivery.errors.total")
                .with_description("Failed deliveries reported on the error channel")
                .build();
            ForwarderMetrics {
                events_processed_total,
                delivery_errors_total,
            }
        })
        .clone()
}

impl ForwarderMetrics {
    #[inline]
    pub fn record_outcome(&self, outcome: &'static str) {
        self.events_processed_total
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }

    #[inline]
    pub fn record_delivery_error(&self, kind: &'static str) {
        self.delivery_errors_total
            .add(1, &[KeyValue::new("kind", kind)]);
    }
}
