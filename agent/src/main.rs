// Endpoint agent binary entry point

use anyhow::{anyhow, Result};
use common::config::Settings;
use common::executor::{
    CommandRunner, ConsoleSessionLocator, PrivilegedScriptExecutor, ScriptExecutor,
    TokioCommandRunner,
};
use common::operations::{OperationsProcessor, SystemOperationsProcessor};
use common::scheduler::{Scheduler, SchedulerConfig, SchedulerService};
use common::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Settings are loaded before logging exists, so failures go to stderr as well
    let settings = Settings::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow!("Failed to load configuration: {}", e)
    })?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.json_logs,
    )?;

    info!("Starting endpoint agent");

    settings.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        anyhow!("Invalid configuration: {}", e)
    })?;

    info!(
        secure_root = %settings.agent.secure_root.display(),
        entry_script = %settings.entry_script_path().display(),
        manifest = %settings.manifest_path().display(),
        "Configuration loaded"
    );

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
        info!(port, "Metrics exporter listening");
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);

    let sessions = Arc::new(ConsoleSessionLocator::new(runner.clone()));
    let executor = PrivilegedScriptExecutor::from_settings(
        &settings.executor,
        &settings.agent.secure_root,
        sessions,
    )
    .map_err(|e| {
        error!(error = %e, "Failed to initialize script executor");
        e
    })?;
    let executor: Arc<dyn ScriptExecutor> = Arc::new(executor);
    info!("Script executor initialized");

    let processor = SystemOperationsProcessor::new(
        settings.agent.secure_root.clone(),
        &settings.operations,
        runner,
    )
    .map_err(|e| {
        error!(error = %e, "Failed to initialize operations processor");
        e
    })?;
    let processor: Arc<dyn OperationsProcessor> = Arc::new(processor);
    info!("Operations processor initialized");

    let scheduler = Arc::new(SchedulerService::new(
        SchedulerConfig::from_settings(&settings),
        executor,
        processor,
    ));

    scheduler.start().await.map_err(|e| {
        error!(error = %e, "Failed to start scheduler");
        e
    })?;

    let shutdown = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat(
        scheduler.clone(),
        Duration::from_secs(settings.scheduler.heartbeat_seconds),
        shutdown.clone(),
    ));

    shutdown_signal().await;

    shutdown.cancel();
    if let Err(e) = heartbeat.await {
        warn!(error = %e, "Heartbeat task ended abnormally");
    }

    if let Err(e) = scheduler.stop().await {
        error!(error = %e, "Error during scheduler shutdown");
    }

    info!("Endpoint agent stopped");
    Ok(())
}

/// Periodically log liveness and the upcoming timer fires until shutdown
async fn heartbeat(scheduler: Arc<SchedulerService>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let next_runs = scheduler.next_execution_times().await;
                let mut timers: Vec<_> = next_runs.into_iter().collect();
                timers.sort_by(|a, b| a.0.cmp(&b.0));
                let summary = timers
                    .iter()
                    .map(|(name, at)| format!("{}={}", name, at.to_rfc3339()))
                    .collect::<Vec<_>>()
                    .join(", ");
                info!(state = %scheduler.state(), next_runs = %summary, "Agent heartbeat");
            }
        }
    }

    info!("Heartbeat task stopped");
}

/// Wait for Ctrl+C or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal, initiating graceful shutdown"),
        () = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
