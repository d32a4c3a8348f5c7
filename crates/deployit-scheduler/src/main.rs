//! deployit worker

use clap::Parser;
use deployit_config::SystemConfig;
use deployit_deployer::object_store_from_config;
use deployit_executor::LocalProcessExecutor;
use deployit_scheduler::{DeployPipeline, DeployQueue, PipelineSettings, Worker, WorkerSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deployit-worker")]
#[command(about = "Runs queued deployit deployments", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (defaults to ./deployit.kdl when present)
    #[arg(short, long, env = "DEPLOYIT_CONFIG")]
    config: Option<PathBuf>,

    /// Worker identifier recorded on leases
    #[arg(long, env = "DEPLOYIT_WORKER_ID")]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = SystemConfig::load(args.config.as_deref())?;
    let worker_id = args
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));

    let queue = DeployQueue::connect(&config.queue).await?;
    let object_store = object_store_from_config(&config.storage).await?;
    let pipeline = Arc::new(DeployPipeline::new(
        Arc::new(LocalProcessExecutor::new()),
        object_store,
        PipelineSettings::from(&config.worker),
    ));

    let worker = Worker::new(
        worker_id,
        queue.store().clone(),
        pipeline,
        WorkerSettings::from(&config.worker),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    worker.run(shutdown).await;
    queue.close().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("DEPLOYIT_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
    shutdown.cancel();
}
