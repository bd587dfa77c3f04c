use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info};

use common::cache::Cache;
use dbuild_coordinator::core::{CoordinatorServer, CoordinatorService};
use dbuild_coordinator::Coordinator;

mod args;
use args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // Note: There are default values for EACH argument.
    let args = Args::parse();

    let addr = format!("[::1]:{}", args.port).parse()?;
    let files = Cache::open(&args.file_cache_dir).await?;
    info!(
        "File cache at {} ({} files)",
        args.file_cache_dir.display(),
        files.list().len()
    );

    let coordinator = Arc::new(Coordinator::new(files, args.options()));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {}", err);
            }
            shutdown.cancel();
        }
    });

    info!("Coordinator listening on {}", addr);
    Server::builder()
        .add_service(CoordinatorServer::new(CoordinatorService::new(
            coordinator.clone(),
        )))
        .serve_with_shutdown(addr, async {
            shutdown.cancelled().await;
            info!("Shutting down...");
            // Ends the open build streams so the server can drain.
            coordinator.stop();
        })
        .await?;

    Ok(())
}
