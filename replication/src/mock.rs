//! In-memory implementations of the replication manager's collaborators.
//!
//! Used by this crate's tests and by embedding services that want to run the
//! manager against synthetic cluster state.

use crate::command::CommandEnvelope;
use crate::interface::{
    ContainerError, ContainerManager, ContainerToken, Event, EventPublisher, NodeManager,
    NodeNotFoundError, NodeNotFoundSnafu, NotLeaderError, PlacementError, PlacementPolicy,
    ScmContext,
};
use crate::move_scheduler::{Consensus, ConsensusError, MoveOp, MovePair, MoveTable};
use crate::placement::PlacementStatus;
use async_trait::async_trait;
use data_types::{
    ContainerId, ContainerInfo, ContainerReplica, DatanodeDetails, DatanodeId, LifeCycleEvent,
    LifeCycleState, NodeStatus, PipelineId, ReplicaState, SequenceNumber,
};
use parking_lot::Mutex;
use snafu::ensure;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A datanode with a fresh identity and the given address.
pub fn datanode(address: &str) -> DatanodeDetails {
    DatanodeDetails::new(DatanodeId::new_random(), address)
}

/// A container holding some data.
pub fn container(id: u64, state: LifeCycleState, replication_factor: usize) -> ContainerInfo {
    ContainerInfo {
        id: ContainerId::new(id),
        state,
        replication_factor,
        used_bytes: 256 * 1024 * 1024,
        key_count: 1000,
        pipeline: PipelineId::new_random(),
        sequence_id: SequenceNumber::new(0),
    }
}

/// A CLOSED container with no data at all.
pub fn empty_container(id: u64, replication_factor: usize) -> ContainerInfo {
    ContainerInfo {
        id: ContainerId::new(id),
        state: LifeCycleState::Closed,
        replication_factor,
        used_bytes: 0,
        key_count: 0,
        pipeline: PipelineId::new_random(),
        sequence_id: SequenceNumber::new(0),
    }
}

/// A replica of `container` on `datanode`, originating there.
pub fn replica(
    container: &ContainerInfo,
    datanode: &DatanodeDetails,
    state: ReplicaState,
) -> ContainerReplica {
    ContainerReplica {
        container_id: container.id,
        datanode: datanode.clone(),
        state,
        bytes_used: container.used_bytes,
        key_count: container.key_count,
        sequence_id: container.sequence_id,
        origin_datanode_id: datanode.id,
    }
}

/// [`ContainerManager`] over plain maps.
#[derive(Debug, Default)]
pub struct MockContainerManager {
    containers: Mutex<BTreeMap<ContainerId, ContainerInfo>>,
    replicas: Mutex<BTreeMap<ContainerId, Vec<ContainerReplica>>>,
}

impl MockContainerManager {
    /// Insert or replace a container.
    pub fn add_container(&self, container: ContainerInfo) {
        self.containers.lock().insert(container.id, container);
    }

    /// Forget a container and its replicas.
    pub fn remove_container(&self, id: ContainerId) {
        self.containers.lock().remove(&id);
        self.replicas.lock().remove(&id);
    }

    /// Insert a replica, replacing any previous report from the same
    /// datanode.
    pub fn add_replica(&self, replica: ContainerReplica) {
        let mut replicas = self.replicas.lock();
        let entries = replicas.entry(replica.container_id).or_default();
        entries.retain(|r| r.datanode != replica.datanode);
        entries.push(replica);
    }

    /// Remove the replica hosted by `datanode`, if any.
    pub fn remove_replica(&self, id: ContainerId, datanode: &DatanodeDetails) {
        if let Some(entries) = self.replicas.lock().get_mut(&id) {
            entries.retain(|r| r.datanode != *datanode);
        }
    }

    /// The container's current lifecycle state.
    pub fn container_state(&self, id: ContainerId) -> Option<LifeCycleState> {
        self.containers.lock().get(&id).map(|c| c.state)
    }
}

impl ContainerManager for MockContainerManager {
    fn containers(&self) -> Vec<ContainerInfo> {
        self.containers.lock().values().cloned().collect()
    }

    fn container(&self, id: ContainerId) -> Result<ContainerInfo, ContainerError> {
        self.containers
            .lock()
            .get(&id)
            .cloned()
            .ok_or(ContainerError::ContainerNotFound { id })
    }

    fn container_replicas(
        &self,
        id: ContainerId,
    ) -> Result<Vec<ContainerReplica>, ContainerError> {
        ensure!(
            self.containers.lock().contains_key(&id),
            crate::interface::ContainerNotFoundSnafu { id }
        );
        Ok(self.replicas.lock().get(&id).cloned().unwrap_or_default())
    }

    fn update_container_state(
        &self,
        id: ContainerId,
        event: LifeCycleEvent,
    ) -> Result<(), ContainerError> {
        let mut containers = self.containers.lock();
        let Some(container) = containers.get_mut(&id) else {
            return Err(ContainerError::ContainerNotFound { id });
        };
        let next = match (container.state, event) {
            (LifeCycleState::Closed, LifeCycleEvent::Delete) => LifeCycleState::Deleting,
            (LifeCycleState::Deleting, LifeCycleEvent::Cleanup) => LifeCycleState::Deleted,
            (state, event) => {
                return Err(ContainerError::InvalidStateTransition { id, event, state })
            }
        };
        container.state = next;
        Ok(())
    }
}

/// [`NodeManager`] over a status map.
#[derive(Debug, Default)]
pub struct MockNodeManager {
    statuses: Mutex<HashMap<DatanodeId, NodeStatus>>,
}

impl MockNodeManager {
    /// Set (or replace) the status of a datanode.
    pub fn register(&self, datanode: &DatanodeDetails, status: NodeStatus) {
        self.statuses.lock().insert(datanode.id, status);
    }
}

impl NodeManager for MockNodeManager {
    fn node_status(&self, datanode: &DatanodeDetails) -> Result<NodeStatus, NodeNotFoundError> {
        self.statuses
            .lock()
            .get(&datanode.id)
            .copied()
            .ok_or_else(|| NodeNotFoundSnafu { id: datanode.id }.build())
    }
}

/// Rack-aware [`PlacementPolicy`].
///
/// Nodes live in the rack assigned to them (everything else shares one
/// default rack). A replica set is compliant when it spans
/// `min(replication_factor, total racks)` racks. `choose` hands out nodes
/// previously offered through [`add_target`](Self::add_target), in order.
#[derive(Debug, Default)]
pub struct MockPlacementPolicy {
    racks: Mutex<HashMap<DatanodeId, String>>,
    pool: Mutex<Vec<DatanodeDetails>>,
}

impl MockPlacementPolicy {
    /// Put `datanode` into `rack`.
    pub fn assign_rack(&self, datanode: &DatanodeDetails, rack: impl Into<String>) {
        self.racks.lock().insert(datanode.id, rack.into());
    }

    /// Offer `datanode` as a choosable replication target.
    pub fn add_target(&self, datanode: DatanodeDetails) {
        self.pool.lock().push(datanode);
    }

    fn rack_of(&self, id: DatanodeId) -> String {
        self.racks
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| "/default".to_string())
    }

    fn total_racks(&self) -> usize {
        self.racks
            .lock()
            .values()
            .collect::<BTreeSet<_>>()
            .len()
            .max(1)
    }
}

impl PlacementPolicy for MockPlacementPolicy {
    fn validate(
        &self,
        replicas: &[DatanodeDetails],
        replication_factor: usize,
    ) -> PlacementStatus {
        let required = replication_factor.min(self.total_racks()).max(1);
        let actual = replicas
            .iter()
            .map(|dn| self.rack_of(dn.id))
            .collect::<BTreeSet<_>>()
            .len();
        if actual >= required {
            PlacementStatus::satisfied(actual)
        } else {
            PlacementStatus::unsatisfied(
                actual,
                required - actual,
                format!("requires {} racks, found {}", required, actual),
            )
        }
    }

    fn choose(
        &self,
        exclude: &[DatanodeDetails],
        required: usize,
        _size_hint: u64,
    ) -> Result<Vec<DatanodeDetails>, PlacementError> {
        let pool = self.pool.lock();
        let chosen: Vec<DatanodeDetails> = pool
            .iter()
            .filter(|dn| !exclude.contains(dn))
            .take(required)
            .cloned()
            .collect();
        ensure!(
            chosen.len() == required,
            crate::interface::NotEnoughNodesSnafu {
                required,
                reason: format!("only {} candidates available", chosen.len()),
            }
        );
        Ok(chosen)
    }
}

/// [`EventPublisher`] that records everything fired at it.
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventPublisher {
    /// Everything fired so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// The datanode command envelopes fired so far.
    pub fn commands(&self) -> Vec<CommandEnvelope> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::DatanodeCommand(envelope) => Some(envelope.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventPublisher for RecordingEventPublisher {
    fn fire(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// [`ScmContext`] with settable leadership state.
#[derive(Debug)]
pub struct MockScmContext {
    leader: AtomicBool,
    leader_ready: AtomicBool,
    safe_mode: AtomicBool,
    term: AtomicU64,
}

impl Default for MockScmContext {
    fn default() -> Self {
        Self {
            leader: AtomicBool::new(false),
            leader_ready: AtomicBool::new(false),
            safe_mode: AtomicBool::new(false),
            term: AtomicU64::new(1),
        }
    }
}

impl MockScmContext {
    /// A context that is the ready leader, out of safe mode.
    pub fn leader_ready() -> Self {
        let context = Self::default();
        context.leader.store(true, Ordering::SeqCst);
        context.leader_ready.store(true, Ordering::SeqCst);
        context
    }

    /// Grant or revoke leadership.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
        if !leader {
            self.leader_ready.store(false, Ordering::SeqCst);
        }
    }

    /// Mark leadership (not) caught up.
    pub fn set_leader_ready(&self, ready: bool) {
        self.leader_ready.store(ready, Ordering::SeqCst);
    }

    /// Enter or leave safe mode.
    pub fn set_safe_mode(&self, safe_mode: bool) {
        self.safe_mode.store(safe_mode, Ordering::SeqCst);
    }

    /// Set the reported leader term.
    pub fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::SeqCst);
    }
}

impl ScmContext for MockScmContext {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn is_leader_ready(&self) -> bool {
        self.leader_ready.load(Ordering::SeqCst)
    }

    fn is_in_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    fn term_of_leader(&self) -> Result<u64, NotLeaderError> {
        if self.is_leader() {
            Ok(self.term.load(Ordering::SeqCst))
        } else {
            Err(NotLeaderError)
        }
    }

    fn container_token(&self, id: ContainerId) -> ContainerToken {
        ContainerToken::new(format!("token-{}", id.get()))
    }
}

/// [`Consensus`] that commits locally, with an injectable failure mode.
#[derive(Debug, Default)]
pub struct LocalConsensus {
    fail: AtomicBool,
    submitted: Mutex<Vec<MoveOp>>,
}

impl LocalConsensus {
    /// Make subsequent submissions fail (or succeed again).
    pub fn fail_submissions(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every successfully committed op, in order.
    pub fn submitted(&self) -> Vec<MoveOp> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn submit(&self, op: &MoveOp) -> Result<(), ConsensusError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConsensusError {
                reason: "injected failure".to_string(),
            });
        }
        self.submitted.lock().push(op.clone());
        Ok(())
    }
}

/// [`MoveTable`] over a plain map.
#[derive(Debug, Default)]
pub struct InMemoryMoveTable {
    entries: Mutex<BTreeMap<ContainerId, MovePair>>,
}

impl InMemoryMoveTable {
    /// Insert or replace the move record for a container.
    pub fn put(&self, container: ContainerId, pair: MovePair) {
        self.entries.lock().insert(container, pair);
    }

    /// Remove the move record for a container.
    pub fn delete(&self, container: ContainerId) {
        self.entries.lock().remove(&container);
    }

    /// All recorded moves.
    pub fn entries(&self) -> Vec<(ContainerId, MovePair)> {
        self.entries
            .lock()
            .iter()
            .map(|(id, pair)| (*id, pair.clone()))
            .collect()
    }
}

impl MoveTable for InMemoryMoveTable {
    fn put(&self, container: ContainerId, pair: MovePair) {
        Self::put(self, container, pair)
    }

    fn delete(&self, container: ContainerId) {
        Self::delete(self, container)
    }

    fn entries(&self) -> Vec<(ContainerId, MovePair)> {
        Self::entries(self)
    }
}
