//! OpenTelemetry tracing export
//!
//! Spans are exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set; the
//! exporter reads its endpoint and headers from the standard OTEL_* variables.

use opentelemetry::KeyValue;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing::{warn, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

const SERVICE_NAME: &str = "extension-operator";

/// Build the OTLP tracing layer for `subscriber`
///
/// Returns `None` when the exporter pipeline cannot be installed, so the
/// operator keeps running with stdout logging only.
pub fn init_telemetry<S>(_subscriber: &S) -> Option<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| SERVICE_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio);

    match tracer {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            warn!("Failed to install OTLP pipeline: {}", e);
            None
        }
    }
}

/// Flush pending spans and shut the exporter down
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
