//! Observability: logging, distributed tracing and metrics.

use opentelemetry_otlp::WithExportConfig;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ObservabilityConfig;

/// Initialize the tracing stack.
///
/// `RUST_LOG` wins over `config.log_level`. Spans are exported over OTLP when
/// `config.otlp_endpoint` is set.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)?,
    };

    // Set up OpenTelemetry tracing if endpoint is provided
    if let Some(endpoint) = config.otlp_endpoint.as_deref() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::config()
                    .with_resource(opentelemetry_sdk::Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                    ])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(filter)
            .with(telemetry_layer)
            .with(fmt_layer(config.json_logging))
            .try_init()?;
    } else {
        // Just use local logging
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer(config.json_logging))
            .try_init()?;
    }

    Ok(())
}

/// JSON lines in production, human readable output otherwise.
fn fmt_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().pretty().boxed()
    }
}

/// Flush and shut down OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{describe_counter, describe_histogram};
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

    /// Install the Prometheus recorder and describe every metric the service emits.
    pub fn install(service_name: &str) -> anyhow::Result<PrometheusHandle> {
        let handle = PrometheusBuilder::new()
            .add_global_label("service", service_name)
            .install_recorder()?;
        register_metrics();
        tracing::info!(service_name = %service_name, "Metrics initialized");
        Ok(handle)
    }

    /// Register all metric descriptions.
    pub fn register_metrics() {
        describe_counter!(
            "perch_jobs_total",
            "Job deliveries by queue and outcome (completed, retried, dead, deferred)"
        );
        describe_counter!(
            "perch_errors_total",
            "Errors raised by code and severity"
        );
        describe_counter!(
            "perch_rate_limit_checks_total",
            "Rate limit decisions by counter backend and outcome"
        );
        describe_counter!(
            "perch_rate_limit_rejected_total",
            "Requests rejected with 429"
        );
        describe_histogram!(
            "perch_job_duration_seconds",
            "Handler execution time in seconds"
        );
    }
}
