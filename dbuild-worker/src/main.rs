use std::net::SocketAddr;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info};

use common::cache::Cache;
use common::WorkerId;

mod archive;

mod core;
use crate::core::{ArtifactService, CoordinatorClient, WorkerServer};

mod args;
use args::Args;

mod executor;
use executor::Executor;

mod heartbeat;
use heartbeat::HeartbeatLoop;

fn start_server(addr: &str, artifacts: Cache, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    info!("Worker server listening on {}", addr);

    tokio::task::spawn(async move {
        let result = Server::builder()
            .add_service(WorkerServer::new(ArtifactService::new(artifacts)))
            .serve_with_shutdown(addr, shutdown.cancelled_owned())
            .await;
        if let Err(err) = result {
            error!("Worker server failed: {}", err);
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let worker = WorkerId::new(format!("{}:{}", args.host, args.port));

    let cache_dir = args.cache_dir();
    let files = Cache::open(cache_dir.join("files")).await?;
    let artifacts = Cache::open(cache_dir.join("artifacts")).await?;
    info!(
        "Cache at {} ({} artifacts)",
        cache_dir.display(),
        artifacts.list().len()
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {}", err);
            }
            info!("Worker exiting...");
            shutdown.cancel();
        }
    });

    // Start server as background task.
    start_server(worker.as_str(), artifacts.clone(), shutdown.clone())?;

    let coordinator = CoordinatorClient::connect(args.address.clone()).await?;
    info!(%worker, "Connected to coordinator at {}", args.address);

    let executor = Executor::new(coordinator.clone(), files, artifacts);
    HeartbeatLoop::new(
        worker,
        coordinator,
        executor,
        args.slots,
        args.heartbeat_interval(),
        args.retry_interval(),
    )
    .run(shutdown)
    .await;

    Ok(())
}
