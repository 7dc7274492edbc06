// Settlement scheduler daemon
//
// Wires configuration, telemetry, the Postgres-backed store and collaborator
// adapters, the batch dispatch table and the claim loop, then runs until a
// shutdown signal arrives and in-flight runs have drained.

use anyhow::Context;
use common::batch::handlers::standard_registry;
use common::batch::BatchProcessor;
use common::clock::{Clock, SystemClock};
use common::collaborators::postgres::{PgLedger, PgPaymentFeed, PgPolicyAdmin};
use common::config::Settings;
use common::db::DbPool;
use common::executor::{JobExecutor, TokenRegistry};
use common::retry::{ExponentialBackoff, RetryStrategy};
use common::scheduler::SchedulerEngine;
use common::store::postgres::{PgHistoryLog, PgJobStore};
use common::telemetry::{self, AlertNotifier, LogAlertNotifier, WebhookAlertNotifier};
use common::window::WindowCoordinator;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        timezone = %settings.settlement.timezone,
        tick_interval_seconds = settings.scheduler.tick_interval_seconds,
        threshold_minor = settings.settlement.threshold_minor,
        "Starting settlement scheduler"
    );

    let db = DbPool::new(&settings.database).await?;
    db.run_migrations().await?;

    let store = Arc::new(PgJobStore::new(db.clone()));
    let history = Arc::new(PgHistoryLog::new(db.clone()));

    let boundaries = settings
        .settlement
        .boundaries()
        .map_err(anyhow::Error::msg)?;
    let tz = settings.settlement.tz().map_err(anyhow::Error::msg)?;
    let windows = Arc::new(WindowCoordinator::new(boundaries, tz)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let processor = Arc::new(BatchProcessor::new(
        Arc::new(PgPaymentFeed::new(db.clone())),
        Arc::new(PgPolicyAdmin::new(db.clone())),
        Arc::new(PgLedger::new(db.clone())),
        history.clone(),
        windows.clone(),
        clock.clone(),
        &settings.settlement,
    ));
    let handlers = Arc::new(standard_registry(processor));

    let retry: Arc<dyn RetryStrategy> = Arc::new(ExponentialBackoff::with_config(
        settings.executor.retry_base_delay_seconds,
        settings.executor.retry_max_delay_seconds,
        settings.executor.retry_jitter_factor,
    ));
    let alerts: Arc<dyn AlertNotifier> = match &settings.alerts.webhook_url {
        Some(url) => Arc::new(WebhookAlertNotifier::new(
            url,
            settings.alerts.timeout_seconds,
        )?),
        None => Arc::new(LogAlertNotifier),
    };

    let executor = Arc::new(JobExecutor::new(
        store.clone(),
        history.clone(),
        handlers,
        Arc::new(TokenRegistry::new()),
        windows.clone(),
        clock.clone(),
        retry.clone(),
        alerts.clone(),
        &settings.executor,
    ));

    let engine = Arc::new(SchedulerEngine::new(
        store,
        history,
        executor,
        windows,
        clock,
        retry,
        alerts,
        settings.scheduler.clone(),
    ));

    let engine_for_shutdown = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received ctrl-c, draining in-flight runs");
        engine_for_shutdown.stop();
    });

    engine.run().await;

    telemetry::shutdown_tracer();
    db.close().await;
    info!("Scheduler stopped");
    Ok(())
}
