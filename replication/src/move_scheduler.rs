//! HA-replicated bookkeeping of active container moves.
//!
//! A move must survive leader re-election: the pair of datanodes involved is
//! committed through the SCM's consensus group before the in-memory record
//! becomes authoritative, and flushed to a persistent table a fresh leader
//! reloads on `reinitialize`.

use async_trait::async_trait;
use data_types::{ContainerId, DatanodeDetails};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// The two endpoints of a replica move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePair {
    /// The datanode losing the replica.
    pub src: DatanodeDetails,
    /// The datanode gaining the replica.
    pub tgt: DatanodeDetails,
}

/// A mutation of the move record, replicated through consensus before it is
/// applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOp {
    /// Record a new move.
    Start {
        /// The container being moved.
        container: ContainerId,
        /// Source and target datanodes.
        pair: MovePair,
    },
    /// Drop a finished move.
    Complete {
        /// The container whose move finished.
        container: ContainerId,
    },
}

/// Error committing a mutation through the consensus group.
#[derive(Debug, Snafu)]
#[snafu(display("consensus rejected the mutation: {}", reason))]
pub struct ConsensusError {
    /// Why the commit failed.
    pub reason: String,
}

/// The SCM's consensus group, reduced to the one operation the scheduler
/// needs: commit a [`MoveOp`] to a quorum.
///
/// `submit` resolves only once the entry is committed; the caller applies
/// the effect to memory afterwards.
#[async_trait]
pub trait Consensus: Debug + Send + Sync {
    /// Commit `op` through the consensus log.
    async fn submit(&self, op: &MoveOp) -> Result<(), ConsensusError>;
}

/// The persistent `ContainerId → (src, tgt)` table behind the scheduler.
///
/// Written through the [`TransactionBuffer`] on the leader, read only on
/// [`MoveScheduler::reinitialize`].
pub trait MoveTable: Debug + Send + Sync {
    /// Insert or replace the move record for a container.
    fn put(&self, container: ContainerId, pair: MovePair);

    /// Remove the move record for a container.
    fn delete(&self, container: ContainerId);

    /// All recorded moves.
    fn entries(&self) -> Vec<(ContainerId, MovePair)>;
}

/// The staging point between committed mutations and the persistent
/// [`MoveTable`].
///
/// Mutations reach this buffer only after their [`MoveOp`] committed on a
/// quorum; the buffer guarantees they reach the table before the in-memory
/// map treats them as durable.
#[derive(Debug)]
pub struct TransactionBuffer {
    table: Arc<dyn MoveTable>,
}

impl TransactionBuffer {
    /// Create a buffer flushing into `table`.
    pub fn new(table: Arc<dyn MoveTable>) -> Self {
        Self { table }
    }

    fn put(&self, container: ContainerId, pair: MovePair) {
        self.table.put(container, pair);
    }

    fn delete(&self, container: ContainerId) {
        self.table.delete(container);
    }
}

/// Replicated record of the moves currently in progress.
#[async_trait]
pub trait MoveScheduler: Debug + Send + Sync {
    /// Record a new move. Idempotent on the in-memory map: re-starting an
    /// already recorded container is a no-op (though the replicated log may
    /// still carry the call).
    async fn start_move(
        &self,
        container: ContainerId,
        pair: MovePair,
    ) -> Result<(), ConsensusError>;

    /// Drop the record of a finished move.
    async fn complete_move(&self, container: ContainerId) -> Result<(), ConsensusError>;

    /// The move recorded for `container`, if any.
    fn get_move(&self, container: ContainerId) -> Option<MovePair>;

    /// All moves currently in progress.
    fn inflight_moves(&self) -> BTreeMap<ContainerId, MovePair>;

    /// Reload the in-memory map from the persistent table. Called once after
    /// this SCM becomes the ready leader.
    fn reinitialize(&self);
}

/// [`MoveScheduler`] that routes every mutation through [`Consensus`] and
/// applies committed mutations to memory and the [`MoveTable`].
#[derive(Debug)]
pub struct ReplicatedMoveScheduler {
    consensus: Arc<dyn Consensus>,
    buffer: TransactionBuffer,
    table: Arc<dyn MoveTable>,
    inflight: Mutex<BTreeMap<ContainerId, MovePair>>,
}

impl ReplicatedMoveScheduler {
    /// Create a scheduler committing through `consensus` and persisting into
    /// `table`.
    pub fn new(consensus: Arc<dyn Consensus>, table: Arc<dyn MoveTable>) -> Self {
        Self {
            consensus,
            buffer: TransactionBuffer::new(Arc::clone(&table)),
            table,
            inflight: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl MoveScheduler for ReplicatedMoveScheduler {
    async fn start_move(
        &self,
        container: ContainerId,
        pair: MovePair,
    ) -> Result<(), ConsensusError> {
        let op = MoveOp::Start {
            container,
            pair: pair.clone(),
        };
        self.consensus.submit(&op).await?;

        let mut inflight = self.inflight.lock();
        if inflight.contains_key(&container) {
            debug!(container=%container, "move already recorded, replicated start is a no-op");
            return Ok(());
        }
        self.buffer.put(container, pair.clone());
        inflight.insert(container, pair);
        Ok(())
    }

    async fn complete_move(&self, container: ContainerId) -> Result<(), ConsensusError> {
        let op = MoveOp::Complete { container };
        self.consensus.submit(&op).await?;

        let mut inflight = self.inflight.lock();
        if inflight.remove(&container).is_some() {
            self.buffer.delete(container);
        }
        Ok(())
    }

    fn get_move(&self, container: ContainerId) -> Option<MovePair> {
        self.inflight.lock().get(&container).cloned()
    }

    fn inflight_moves(&self) -> BTreeMap<ContainerId, MovePair> {
        self.inflight.lock().clone()
    }

    fn reinitialize(&self) {
        let mut inflight = self.inflight.lock();
        inflight.clear();
        for (container, pair) in self.table.entries() {
            inflight.insert(container, pair);
        }
    }
}
