//! Single-writer actor around a partition's [`NodeIdAllocator`].
//!
//! Every allocation mutation of a partition goes through one task that owns
//! the allocator and processes [`PartitionRequest`]s in arrival order, so
//! mutations of the same sequence never interleave. Callers talk to it via a
//! cloneable [`PartitionHandle`].

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    BackupChannel, Error, LogicalNodeId, MemberAddress, NodeIdAllocator, PartitionId,
    PartitionSnapshot, Result, SequenceDefinition,
};

/// Requests served by [`partition_loop`].
#[derive(Debug)]
pub enum PartitionRequest {
    Acquire {
        definition: SequenceDefinition,
        requester: MemberAddress,
        response: oneshot::Sender<Result<LogicalNodeId>>,
    },
    Release {
        definition: SequenceDefinition,
        requester: MemberAddress,
        node_id: LogicalNodeId,
        response: oneshot::Sender<Result<()>>,
    },
    ReleaseMember {
        address: MemberAddress,
        response: oneshot::Sender<Result<usize>>,
    },
    DropSequence {
        sequence: String,
        response: oneshot::Sender<Result<()>>,
    },
    SetBackups {
        backups: Vec<MemberAddress>,
        response: oneshot::Sender<Vec<MemberAddress>>,
    },
    Snapshot {
        response: oneshot::Sender<PartitionSnapshot>,
    },
    /// Stops the actor, handing back its final state.
    Shutdown {
        response: oneshot::Sender<PartitionSnapshot>,
    },
}

/// Serves requests for one partition until shut down.
///
/// Exits on [`PartitionRequest::Shutdown`], when `shutdown` is cancelled or
/// once every [`PartitionHandle`] is dropped. A cancelled actor drops queued
/// requests; their callers observe [`Error::Unavailable`].
pub async fn partition_loop<C: BackupChannel>(
    mut allocator: NodeIdAllocator<C>,
    mut rx: mpsc::Receiver<PartitionRequest>,
    shutdown: CancellationToken,
) {
    let partition = allocator.partition();
    trace!(partition, "Partition actor started");

    loop {
        let request = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        match request {
            PartitionRequest::Acquire {
                definition,
                requester,
                response,
            } => {
                let result = allocator.allocate(&definition, &requester).await;
                reply(partition, response, result);
            }
            PartitionRequest::Release {
                definition,
                requester,
                node_id,
                response,
            } => {
                let result = allocator.release(&definition, &requester, node_id).await;
                reply(partition, response, result);
            }
            PartitionRequest::ReleaseMember { address, response } => {
                let result = allocator.release_member(&address).await;
                reply(partition, response, result);
            }
            PartitionRequest::DropSequence { sequence, response } => {
                let result = allocator.drop_sequence(&sequence).await;
                reply(partition, response, result);
            }
            PartitionRequest::SetBackups { backups, response } => {
                allocator.set_backups(backups).await;
                reply(partition, response, allocator.backups().to_vec());
            }
            PartitionRequest::Snapshot { response } => {
                reply(partition, response, allocator.snapshot());
            }
            PartitionRequest::Shutdown { response } => {
                debug!(partition, "Partition actor received shutdown signal");
                reply(partition, response, allocator.snapshot());
                break;
            }
        }
    }

    trace!(partition, "Partition actor stopped");
}

fn reply<T>(partition: PartitionId, response: oneshot::Sender<T>, value: T) {
    if response.send(value).is_err() {
        error!(partition, "Requester went away before the reply");
    }
}

/// Cloneable sender side of a running [`partition_loop`].
#[derive(Clone, Debug)]
pub struct PartitionHandle {
    partition: PartitionId,
    tx: mpsc::Sender<PartitionRequest>,
    shutdown: CancellationToken,
}

impl PartitionHandle {
    /// Spawns the actor for `allocator` on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] outside of a Tokio runtime.
    pub fn spawn<C: BackupChannel>(allocator: NodeIdAllocator<C>, buffer: usize) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::unavailable(format!("no Tokio runtime: {e}")))?;
        let partition = allocator.partition();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let shutdown = CancellationToken::new();
        runtime.spawn(partition_loop(allocator, rx, shutdown.clone()));
        Ok(Self {
            partition,
            tx,
            shutdown,
        })
    }

    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    pub async fn acquire(
        &self,
        definition: &SequenceDefinition,
        requester: &MemberAddress,
    ) -> Result<LogicalNodeId> {
        self.call(|response| PartitionRequest::Acquire {
            definition: definition.clone(),
            requester: requester.clone(),
            response,
        })
        .await?
    }

    pub async fn release(
        &self,
        definition: &SequenceDefinition,
        requester: &MemberAddress,
        node_id: LogicalNodeId,
    ) -> Result<()> {
        self.call(|response| PartitionRequest::Release {
            definition: definition.clone(),
            requester: requester.clone(),
            node_id,
            response,
        })
        .await?
    }

    pub async fn release_member(&self, address: &MemberAddress) -> Result<usize> {
        self.call(|response| PartitionRequest::ReleaseMember {
            address: address.clone(),
            response,
        })
        .await?
    }

    pub async fn drop_sequence(&self, sequence: &str) -> Result<()> {
        self.call(|response| PartitionRequest::DropSequence {
            sequence: sequence.to_owned(),
            response,
        })
        .await?
    }

    /// Installs a new backup list and returns the backups actually in use.
    pub async fn set_backups(&self, backups: Vec<MemberAddress>) -> Result<Vec<MemberAddress>> {
        self.call(|response| PartitionRequest::SetBackups { backups, response })
            .await
    }

    pub async fn snapshot(&self) -> Result<PartitionSnapshot> {
        self.call(|response| PartitionRequest::Snapshot { response })
            .await
    }

    /// Stops the actor after the requests queued before this one.
    pub async fn shutdown(&self) -> Result<PartitionSnapshot> {
        self.call(|response| PartitionRequest::Shutdown { response })
            .await
    }

    /// Stops the actor immediately, as if its member crashed.
    pub fn abort(&self) {
        self.shutdown.cancel();
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> PartitionRequest,
    ) -> Result<T> {
        if self.shutdown.is_cancelled() {
            return Err(self.gone());
        }
        let (response, rx) = oneshot::channel();
        self.tx
            .send(request(response))
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())
    }

    fn gone(&self) -> Error {
        Error::unavailable(format!("partition {} is not running", self.partition))
    }
}
