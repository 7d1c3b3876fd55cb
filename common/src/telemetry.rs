// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over the configured level. JSON output carries
/// the current span, target, thread ids, and source location on every event.
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, json = json, "Structured logging initialized");

    Ok(())
}

/// Initialize the Prometheus metrics exporter and describe all agent metrics
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("127.0.0.1:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "agent_operations_total",
        "System operations processed, labelled by type and outcome"
    );
    describe_counter!(
        "agent_script_executions_total",
        "Automation script executions, labelled by context and outcome"
    );
    describe_histogram!(
        "agent_script_duration_seconds",
        "Duration of automation script executions in seconds"
    );
    describe_counter!(
        "agent_signature_validations_total",
        "Operation record signature validations, labelled by outcome"
    );
    describe_counter!(
        "agent_scheduled_runs_total",
        "Scheduled timer runs, labelled by timer"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://{}/metrics", addr),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

#[inline]
pub fn record_operation(operation_type: &str, success: bool) {
    counter!(
        "agent_operations_total",
        "operation_type" => operation_type.to_string(),
        "outcome" => outcome(success)
    )
    .increment(1);
}

#[inline]
pub fn record_script_execution(context: &str, success: bool, duration_seconds: f64) {
    counter!(
        "agent_script_executions_total",
        "context" => context.to_string(),
        "outcome" => outcome(success)
    )
    .increment(1);
    histogram!("agent_script_duration_seconds", "context" => context.to_string())
        .record(duration_seconds);
}

#[inline]
pub fn record_signature_validation(valid: bool) {
    counter!(
        "agent_signature_validations_total",
        "outcome" => if valid { "valid" } else { "invalid" }
    )
    .increment(1);
}

#[inline]
pub fn record_scheduled_run(timer: &str) {
    counter!("agent_scheduled_runs_total", "timer" => timer.to_string()).increment(1);
}
