// Structured logging, metrics and operator alerting.

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
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::models::JobKind;

const SERVICE_NAME: &str = "boda-settlement";

/// Initialize the tracing subscriber with JSON formatting.
///
/// Log levels come from `RUST_LOG` when set, otherwise from `log_level`.
/// When `tracing_endpoint` is given, spans are also exported over OTLP.
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Bad log filter {:?}: {}", log_level, e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let otel_layer = match tracing_endpoint {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(init_tracer(endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(json_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Tracing subscriber already set: {}", e))?;

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Logging initialized"
    );

    Ok(())
}

fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("OTLP span exporter setup failed: {}", e))?;

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

    tracing::info!(endpoint = endpoint, "OTLP trace export enabled");

    Ok(tracer)
}

/// Flush remaining spans. Called on graceful shutdown.
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the metrics the scheduler
/// and executor emit.
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Prometheus exporter install failed: {}", e))?;

    describe_counter!("job_success_total", "Completed job runs");
    describe_counter!("job_failed_total", "Failed job runs");
    describe_counter!("job_retries_total", "Retry attempts across all jobs");
    describe_histogram!("job_duration_seconds", "Job run duration in seconds");
    describe_gauge!("jobs_due_backlog", "Due jobs seen by the last scheduler tick");
    describe_counter!(
        "stale_leases_reclaimed_total",
        "Running jobs reclaimed after their heartbeat went silent"
    );
    describe_counter!(
        "settlement_riders_total",
        "Riders handled by settlement batches, by outcome"
    );
    describe_counter!(
        "settlement_payments_total",
        "Confirmed payments examined by settlement batches"
    );

    tracing::info!(metrics_port = metrics_port, "Metrics endpoint listening");

    Ok(())
}

#[inline]
pub fn record_job_success(job_name: &str, kind: JobKind) {
    counter!("job_success_total", "job_name" => job_name.to_string(), "kind" => kind.to_string())
        .increment(1);
}

#[inline]
pub fn record_job_failure(job_name: &str, kind: JobKind, reason: &str) {
    counter!(
        "job_failed_total",
        "job_name" => job_name.to_string(),
        "kind" => kind.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_retry(job_name: &str) {
    counter!("job_retries_total", "job_name" => job_name.to_string()).increment(1);
}

#[inline]
pub fn record_job_duration(job_name: &str, kind: JobKind, duration_seconds: f64) {
    histogram!(
        "job_duration_seconds",
        "job_name" => job_name.to_string(),
        "kind" => kind.to_string()
    )
    .record(duration_seconds);
}

#[inline]
pub fn update_due_backlog(size: usize) {
    gauge!("jobs_due_backlog").set(size as f64);
}

#[inline]
pub fn record_stale_lease_reclaimed(count: u64) {
    counter!("stale_leases_reclaimed_total").increment(count);
}

/// `outcome` is one of "succeeded", "failed", "skipped".
#[inline]
pub fn record_settlement_riders(outcome: &str, count: u64) {
    counter!("settlement_riders_total", "outcome" => outcome.to_string()).increment(count);
}

#[inline]
pub fn record_settlement_payments(count: u64) {
    counter!("settlement_payments_total").increment(count);
}

/// Operator alerting for runs that end badly (retry budget exhausted,
/// permanent errors, reclaimed leases). Alert delivery failures are logged
/// by callers and never fail the run that raised them.
#[async_trait::async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(&self, job_id: Uuid, job_name: &str, message: &str) -> Result<()>;
}

/// Default notifier: alerts land in the log stream at ERROR level.
pub struct LogAlertNotifier;

#[async_trait::async_trait]
impl AlertNotifier for LogAlertNotifier {
    async fn send_alert(&self, job_id: Uuid, job_name: &str, message: &str) -> Result<()> {
        tracing::error!(
            job_id = %job_id,
            job_name = job_name,
            alert = message,
            "ALERT: {}",
            message
        );
        Ok(())
    }
}

/// Posts alerts as JSON to an operator-configured endpoint.
pub struct WebhookAlertNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertNotifier {
    pub fn new(url: impl Into<String>, timeout_seconds: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build alert HTTP client: {}", e))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl AlertNotifier for WebhookAlertNotifier {
    async fn send_alert(&self, job_id: Uuid, job_name: &str, message: &str) -> Result<()> {
        let payload = serde_json::json!({
            "service": SERVICE_NAME,
            "job_id": job_id,
            "job_name": job_name,
            "message": message,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Alert webhook request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Alert webhook returned status {}: {}",
                status,
                body
            ));
        }

        Ok(())
    }
}
