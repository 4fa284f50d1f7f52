#![doc = include_str!("../README.md")]

mod node;

use clap::Parser;
use node::config::{CliArgs, NodeConfig};
use node::telemetry::init_telemetry;
use node::workload::{attach_all, detach_all, run_round, verify};
use snowlease::{LocalCluster, PartitionRouter};
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = NodeConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let cluster = LocalCluster::start(config.cluster.clone())?;
    let definition = cluster.registry().create_sequence(config.definition.clone())?;
    let mut generators = attach_all(&cluster, &config).await?;

    let mut rounds = vec![run_round(&generators, config.ids_per_generator, &shutdown).await?];

    if config.fail_owner && !shutdown.is_cancelled() {
        let router = cluster.router();
        let partition = router.partition_of(definition.name());
        if let Some(owner) = router.owner_of(partition) {
            tracing::warn!(%owner, partition, "Failing partition owner");
            let migrated = cluster.fail_member(&owner).await?;

            // Generators on the failed member are gone with it.
            generators.retain(|g| {
                let crashed = g.member == owner;
                if crashed {
                    g.sequencer.mark_destroyed();
                }
                !crashed
            });
            let released = cluster.release_member(&owner).await?;
            tracing::info!(
                migrated = migrated.len(),
                released,
                new_owner = ?router.owner_of(partition),
                "Failover complete"
            );
        }
    }

    rounds.push(run_round(&generators, config.ids_per_generator, &shutdown).await?);
    let checked = verify(&rounds)?;
    tracing::info!(ids = checked, "All IDs unique");

    detach_all(&generators).await;
    cluster.destroy_sequence(definition.name()).await?;
    cluster.shutdown().await;
    Ok(())
}

fn log_startup_info(config: &NodeConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting local cluster with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting local cluster with {} members and {} generators",
            config.cluster.members,
            config.total_generators()
        );
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, stopping generators...");
    shutdown.cancel();
}
