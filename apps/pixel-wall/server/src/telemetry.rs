use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "pixel-wall";

/// Counters the service emits, with their `/metrics` help text.
pub const COUNTERS: &[(&str, &str)] = &[
    ("pixel_wall_tokens_issued_total", "Channel tokens handed out by POST /token."),
    (
        "pixel_wall_token_verify_total",
        "Upgrade attempts by token outcome (accepted, rejected, missing).",
    ),
    ("pixel_wall_tokens_swept_total", "Unconsumed tokens dropped by the retention sweep."),
    ("pixel_wall_connections_total", "WebSocket clients registered since start."),
    ("pixel_wall_paints_total", "Pixels painted by inbound frames."),
    (
        "pixel_wall_broadcast_sends_total",
        "Grid deliveries by outcome (delivered, failed).",
    ),
    (
        "pixel_wall_liveness_pruned_total",
        "Clients dropped by the liveness sweep, by reason.",
    ),
];

pub const GAUGES: &[(&str, &str)] = &[(
    "pixel_wall_clients_active",
    "Clients currently in the registry.",
)];

/// Keeps the metrics recorder and span exporter for the life of the process.
/// Dropping it flushes and shuts down the exporter.
pub struct TelemetryGuard {
    metrics: PrometheusHandle,
    spans: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics.clone()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(spans) = self.spans.take() else {
            return;
        };
        if let Err(err) = spans.shutdown() {
            warn!(error = %err, "span exporter did not shut down cleanly");
        }
    }
}

/// Installs the Prometheus recorder and the global `tracing` subscriber.
///
/// Log verbosity comes from `RUST_LOG` (default `info`). With `otel_stdout`
/// set, spans are also exported to stdout through OpenTelemetry.
pub fn install(otel_stdout: bool) -> Result<TelemetryGuard> {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;
    describe_metrics();

    let spans = otel_stdout.then(span_provider);
    let otel_layer = spans
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(otel_layer)
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    if let Some(provider) = &spans {
        global::set_tracer_provider(provider.clone());
    }
    Ok(TelemetryGuard { metrics, spans })
}

fn describe_metrics() {
    for &(name, help) in COUNTERS {
        describe_counter!(name, help);
    }
    for &(name, help) in GAUGES {
        describe_gauge!(name, help);
    }
}

fn span_provider() -> SdkTracerProvider {
    let resource = Resource::builder()
        .with_attributes([KeyValue::new("service.name", SERVICE_NAME)])
        .build();
    SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build()
}
