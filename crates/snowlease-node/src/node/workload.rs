use std::{collections::HashSet, sync::Arc, time::Instant};

use anyhow::{Context, bail};
use futures::future::try_join_all;
use snowlease::{Error, LocalCluster, LocalSequencer, MemberAddress, SequenceId};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::NodeConfig;

/// A generator and the member it runs on.
pub struct Generator {
    pub member: MemberAddress,
    pub sequencer: Arc<LocalSequencer>,
}

/// IDs produced by one generator in one round.
pub struct Batch {
    pub node_id: Option<u16>,
    pub ids: Vec<SequenceId>,
}

/// Creates and attaches `generators_per_member` sequencers on every member.
pub async fn attach_all(cluster: &LocalCluster, config: &NodeConfig) -> anyhow::Result<Vec<Generator>> {
    let mut generators = Vec::with_capacity(config.total_generators());
    for member in cluster.members() {
        for _ in 0..config.generators_per_member {
            let sequencer = cluster.sequencer(member, config.definition.name())?;
            sequencer
                .attach()
                .await
                .with_context(|| format!("Failed to attach on {member}"))?;
            info!(
                %member,
                node_id = sequencer.logical_node_id(),
                "Generator attached"
            );
            generators.push(Generator {
                member: member.clone(),
                sequencer,
            });
        }
    }
    Ok(generators)
}

/// Runs every generator concurrently until each produced `count` IDs or
/// `shutdown` fired.
pub async fn run_round(
    generators: &[Generator],
    count: usize,
    shutdown: &CancellationToken,
) -> anyhow::Result<Vec<Batch>> {
    let started = Instant::now();
    let tasks = generators.iter().map(|generator| {
        let sequencer = Arc::clone(&generator.sequencer);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                match sequencer.next_id_cancellable(&shutdown).await {
                    Ok(id) => ids.push(id),
                    Err(Error::Cancelled) => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(Batch {
                node_id: sequencer.logical_node_id(),
                ids,
            })
        })
    });

    let batches = try_join_all(tasks)
        .await
        .context("Generator task panicked")?
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    let total: usize = batches.iter().map(|b| b.ids.len()).sum();
    let elapsed = started.elapsed();
    info!(
        ids = total,
        elapsed_ms = elapsed.as_millis() as u64,
        ids_per_sec = (total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
        "Round complete"
    );
    Ok(batches)
}

/// Checks that no ID was produced twice and that each generator's IDs are
/// strictly increasing. Returns the number of IDs checked.
pub fn verify(rounds: &[Vec<Batch>]) -> anyhow::Result<usize> {
    let mut seen = HashSet::new();
    for batch in rounds.iter().flatten() {
        if !batch.ids.windows(2).all(|w| w[0] < w[1]) {
            bail!("IDs of node {:?} are not strictly increasing", batch.node_id);
        }
        for id in &batch.ids {
            if !seen.insert(*id) {
                bail!("Duplicate ID {id} from node {:?}", batch.node_id);
            }
        }
    }
    Ok(seen.len())
}

/// Detaches every generator that is still attached.
pub async fn detach_all(generators: &[Generator]) {
    for generator in generators {
        if let Err(e) = generator.sequencer.detach().await {
            warn!(member = %generator.member, error = %e, "Detach failed");
        }
    }
}
