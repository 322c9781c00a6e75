use anyhow::Result;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{SdkTracerProvider, Tracer};
use std::env;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DIRECTIVES: &str = "info,coord=info,volume=info";

/// Installs the global tracing subscriber: env filter, compact fmt output and
/// an OpenTelemetry layer. Spans go to stdout unless `OTEL_TRACES_EXPORTER=otlp`.
pub fn init_telemetry(service_name: &'static str) {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otlp_enabled = env::var("OTEL_TRACES_EXPORTER")
        .map(|v| v == "otlp")
        .unwrap_or(false);

    let provider = if otlp_enabled {
        let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4318/v1/traces".to_string());
        match otlp_provider(&endpoint) {
            Ok(provider) => provider,
            Err(e) => {
                eprintln!(
                    "failed to initialize OTLP exporter for {} ({}), using stdout",
                    service_name, e
                );
                stdout_provider()
            }
        }
    } else {
        stdout_provider()
    };

    let tracer: Tracer = provider.tracer(service_name);
    global::set_tracer_provider(provider);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(OpenTelemetryLayer::new(tracer))
        .try_init();
}

fn otlp_provider(endpoint: &str) -> Result<SdkTracerProvider> {
    use opentelemetry_otlp::WithExportConfig;

    // Only the HTTP transport is wired; gRPC collectors need an HTTP receiver.
    if endpoint.contains(":4317") {
        anyhow::bail!("gRPC OTLP endpoint {} is not supported", endpoint);
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_simple_exporter(exporter)
        .build())
}

fn stdout_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build()
}
