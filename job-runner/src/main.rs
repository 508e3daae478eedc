use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use job_runner::api::{ApiServer, AppState};
use job_runner::cli::{Args, Commands};
use job_runner::config::RunnerConfig;
use job_runner::dispatcher::Dispatcher;
use job_runner::logging;
use job_runner::notification::{
    AlertChannel, NoopAlertChannel, PgUserNotifier, UserNotifier, WebhookAlertChannel,
};
use job_runner::processor::JobProcessor;
use job_runner::registry::TaskRegistry;
use job_runner::runner::ProcessRunner;
use job_runner::store::{HttpJobSource, JobSource, JobStore, PgJobStore, init_pool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = RunnerConfig::from_env()?;
    if let Some(port) = args.port {
        config.listener.port = port;
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = dir.clone();
    }

    let _guard = logging::init_logging(&config.log_dir)?;
    let cancel = CancellationToken::new();
    logging::start_retention_cleanup(config.log_dir.clone(), cancel.clone());

    let registry = Arc::new(build_registry(&config)?);
    registry.log_registered();

    let pool = init_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to the job store")?;
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let notifier: Arc<dyn UserNotifier> = Arc::new(PgUserNotifier::new(pool));
    let alerts: Arc<dyn AlertChannel> = match &config.alert_webhook {
        Some(webhook) => Arc::new(WebhookAlertChannel::new(webhook.clone())),
        None => {
            info!("ALERT_WEBHOOK_URL not set; alerting disabled");
            Arc::new(NoopAlertChannel)
        }
    };
    let source: Arc<dyn JobSource> = Arc::new(HttpJobSource::new(
        config.job_service_url.clone(),
        config.gateway_timeout,
    )?);

    let processor = Arc::new(JobProcessor::new(
        store.clone(),
        registry,
        ProcessRunner::new(config.runner.clone()),
        notifier,
        alerts.clone(),
        Arc::new(Mutex::new(())),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        source,
        store,
        processor,
        alerts,
        config.dispatcher.clone(),
    ));

    let result = match args.command() {
        Commands::Serve => serve(&config, dispatcher, cancel.clone()).await,
        Commands::Drain => drain(dispatcher).await,
    };
    cancel.cancel();
    result
}

fn build_registry(config: &RunnerConfig) -> anyhow::Result<TaskRegistry> {
    let registry = match &config.registry_file {
        Some(path) => {
            info!(path = %path.display(), "Loading task registry");
            TaskRegistry::from_file(path, &config.tasks_dir, config.interpreter.clone())?
        }
        None => TaskRegistry::builtin(&config.tasks_dir, config.interpreter.clone()),
    };
    if registry.is_empty() {
        anyhow::bail!("Task registry is empty");
    }
    Ok(registry)
}

async fn serve(
    config: &RunnerConfig,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let dispatch_loop = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown signal received");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        });
    }

    let server = ApiServer::new(config.listener.clone(), AppState::new(dispatcher));
    let served = server.run(cancel.clone()).await;

    // Let the current cycle finish before exiting.
    cancel.cancel();
    if let Err(e) = dispatch_loop.await {
        error!(error = %e, "Dispatch loop task failed");
    }

    served.context("Notify listener failed")?;
    info!("job-runner stopped");
    Ok(())
}

async fn drain(dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{}", line.trim_end());
        }
    });

    let report = dispatcher.drain(tx).await;
    printer.await?;

    info!(
        completed = report.parallel.completed + report.serial.completed,
        failed = report.parallel.failed + report.serial.failed,
        "Drain finished"
    );
    Ok(())
}
