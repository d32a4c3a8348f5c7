//! deployit API server

use clap::Parser;
use deployit_api::{AppState, routes};
use deployit_config::{QueueBackend, SystemConfig};
use deployit_deployer::object_store_from_config;
use deployit_executor::LocalProcessExecutor;
use deployit_scheduler::{DeployPipeline, DeployQueue, PipelineSettings, Worker, WorkerSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deployit-server")]
#[command(about = "HTTP API for submitting and tracking deployments", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (defaults to ./deployit.kdl when present)
    #[arg(short, long, env = "DEPLOYIT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = SystemConfig::load(args.config.as_deref())?;

    let queue = DeployQueue::connect(&config.queue).await?;
    let object_store = object_store_from_config(&config.storage).await?;
    let state = AppState::new(
        queue.clone(),
        object_store.clone(),
        config.worker.artifact_dir.clone(),
    );

    // The memory queue only lives in this process, so it needs a worker here.
    let shutdown = CancellationToken::new();
    let embedded = match config.queue.backend {
        QueueBackend::Memory => {
            let worker = Worker::new(
                "server-embedded",
                queue.store().clone(),
                Arc::new(DeployPipeline::new(
                    Arc::new(LocalProcessExecutor::new()),
                    object_store,
                    PipelineSettings::from(&config.worker),
                )),
                WorkerSettings::from(&config.worker),
            );
            info!("Starting embedded worker for the memory queue");
            let token = shutdown.clone();
            Some(tokio::spawn(async move { worker.run(token).await }))
        }
        QueueBackend::Postgres => None,
    };

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(&config.server.listen).await?;
    info!(addr = %config.server.listen, "Starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Some(handle) = embedded {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Embedded worker panicked");
        }
    }
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

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
