// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "program-scheduler";

/// Initialize structured logging with JSON formatting and trace context
///
/// This function sets up the tracing subscriber with:
/// - JSON formatting for structured logs
/// - Trace context (trace_id, span_id) in all log entries
/// - Log levels from configuration or `RUST_LOG`
/// - Optional OpenTelemetry integration
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Shutdown OpenTelemetry tracer provider
///
/// This should be called on graceful shutdown to flush remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe scheduler metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "notifications_received_total",
        "Total number of notifications received, by type"
    );
    describe_counter!("schedule_launch_total", "Total number of program launches");
    describe_counter!(
        "schedule_launch_failed_total",
        "Total number of launches that failed after all retries"
    );
    describe_counter!(
        "schedule_skipped_total",
        "Total number of cycles skipped by a constraint"
    );
    describe_counter!(
        "schedule_cas_conflict_total",
        "Total number of conflicting schedule state writes"
    );
    describe_histogram!(
        "schedule_launch_duration_seconds",
        "Time spent submitting a launch to the program runtime"
    );
    describe_gauge!(
        "scheduler_queue_depth",
        "Work items waiting in the shard queues"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_notification_received(notification_type: &str) {
    counter!("notifications_received_total", "type" => notification_type.to_string()).increment(1);
}

#[inline]
pub fn record_launch(schedule: &str, program: &str) {
    counter!(
        "schedule_launch_total",
        "schedule" => schedule.to_string(),
        "program" => program.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_launch_failure(schedule: &str, reason: &str) {
    counter!(
        "schedule_launch_failed_total",
        "schedule" => schedule.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_skip(schedule: &str) {
    counter!("schedule_skipped_total", "schedule" => schedule.to_string()).increment(1);
}

#[inline]
pub fn record_cas_conflict(schedule: &str) {
    counter!("schedule_cas_conflict_total", "schedule" => schedule.to_string()).increment(1);
}

#[inline]
pub fn record_launch_duration(schedule: &str, duration_seconds: f64) {
    histogram!(
        "schedule_launch_duration_seconds",
        "schedule" => schedule.to_string()
    )
    .record(duration_seconds);
}

/// Set the number of queued work items across shards
#[inline]
pub fn update_queue_depth(depth: i64) {
    gauge!("scheduler_queue_depth").set(depth as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_installs_global_subscriber_once() {
        let _ = init_logging("info", None);
        assert!(init_logging("debug", None).is_err());
    }

    #[test]
    fn test_metrics_recording() {
        // Recording without an installed exporter must not panic
        record_notification_received("TIME");
        record_launch("ns.daily", "ns.app.program");
        record_launch_failure("ns.daily", "unavailable");
        record_skip("ns.daily");
        record_cas_conflict("ns.daily");
        record_launch_duration("ns.daily", 0.25);
        update_queue_depth(3);
    }
}
