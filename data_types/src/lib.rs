//! Shared data types for the Storage Container Manager.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Unique ID of a storage container. Totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(u64);

impl ContainerId {
    /// Create a new `ContainerId`.
    pub fn new(v: u64) -> Self {
        Self(v)
    }

    /// Read the inner value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The block-commit sequence id (BCSID) of a container or replica.
///
/// Monotonically increasing. `-1` means no data has ever been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// Sentinel for "no committed data".
    pub const NONE: Self = Self(-1);

    /// Create a new `SequenceNumber`.
    pub fn new(v: i64) -> Self {
        Self(v)
    }

    /// Read the inner value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID of a write pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineId(Uuid);

impl PipelineId {
    /// Create a `PipelineId` from an existing UUID.
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create a random `PipelineId`.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Read the inner UUID.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Display for PipelineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID of a datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatanodeId(Uuid);

impl DatanodeId {
    /// Create a `DatanodeId` from an existing UUID.
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create a random `DatanodeId`.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Read the inner UUID.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Display for DatanodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity and address of a datanode.
///
/// Equality, ordering and hashing track the node identity only, not its
/// current network location: a node that re-registers under a new address is
/// still the same node.
#[derive(Debug, Clone)]
pub struct DatanodeDetails {
    /// The node identity.
    pub id: DatanodeId,
    /// The network address the node last registered with.
    pub address: String,
}

impl DatanodeDetails {
    /// Create a new `DatanodeDetails`.
    pub fn new(id: DatanodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

impl PartialEq for DatanodeDetails {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DatanodeDetails {}

impl PartialOrd for DatanodeDetails {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DatanodeDetails {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for DatanodeDetails {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Display for DatanodeDetails {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.address, self.id)
    }
}

/// The administrative state of a datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOperationalState {
    /// Fully participating in the cluster.
    InService,
    /// Being drained prior to removal.
    Decommissioning,
    /// Drained and removed from service.
    Decommissioned,
    /// Being drained prior to maintenance.
    EnteringMaintenance,
    /// Offline for maintenance; expected to return.
    InMaintenance,
}

/// The liveness of a datanode as seen through heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeHealth {
    /// Heartbeats arriving on schedule.
    Healthy,
    /// Heartbeats missed recently.
    Stale,
    /// Heartbeats missed long enough to consider the node gone.
    Dead,
}

/// Combined administrative and liveness state of a datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeStatus {
    /// Administrative state.
    pub operational: NodeOperationalState,
    /// Liveness.
    pub health: NodeHealth,
}

impl NodeStatus {
    /// Create a new `NodeStatus`.
    pub fn new(operational: NodeOperationalState, health: NodeHealth) -> Self {
        Self {
            operational,
            health,
        }
    }

    /// The status of a node that is fully available.
    pub fn healthy_in_service() -> Self {
        Self::new(NodeOperationalState::InService, NodeHealth::Healthy)
    }

    /// Heartbeats are arriving on schedule.
    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }

    /// The node is administratively in service.
    pub fn is_in_service(&self) -> bool {
        self.operational == NodeOperationalState::InService
    }

    /// The node is in, or entering, maintenance.
    pub fn is_in_maintenance(&self) -> bool {
        matches!(
            self.operational,
            NodeOperationalState::EnteringMaintenance | NodeOperationalState::InMaintenance
        )
    }

    /// The node is being, or has been, decommissioned.
    pub fn is_decommission(&self) -> bool {
        matches!(
            self.operational,
            NodeOperationalState::Decommissioning | NodeOperationalState::Decommissioned
        )
    }
}

/// Lifecycle state of a container.
///
/// Containers only move forward: `Open → Closing → QuasiClosed → Closed →
/// Deleting → Deleted`, with `QuasiClosed` skipped on the happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifeCycleState {
    /// Accepting writes.
    Open,
    /// Close requested, replicas still closing.
    Closing,
    /// Closed without full pipeline agreement; may need a force-close.
    QuasiClosed,
    /// Immutable.
    Closed,
    /// Replica deletion in progress.
    Deleting,
    /// Fully removed; terminal.
    Deleted,
}

impl Display for LifeCycleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::QuasiClosed => "QUASI_CLOSED",
            Self::Closed => "CLOSED",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Events that advance a container's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifeCycleEvent {
    /// `Closed → Deleting`.
    Delete,
    /// `Deleting → Deleted`.
    Cleanup,
}

/// State of one container replica as reported by its datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaState {
    /// Accepting writes.
    Open,
    /// Closing in response to a close command.
    Closing,
    /// Closed without full pipeline agreement.
    QuasiClosed,
    /// Immutable.
    Closed,
    /// The datanode flagged the replica as damaged.
    Unhealthy,
}

impl ReplicaState {
    /// Whether a replica in this state is the healthy representation of a
    /// container in `container_state`.
    ///
    /// This is an exact match: an `Open` replica matches only an `Open`
    /// container, a `Closed` replica only a `Closed` container, and so on.
    /// Nothing matches `Deleting` or `Deleted` containers.
    pub fn matches(&self, container_state: LifeCycleState) -> bool {
        matches!(
            (self, container_state),
            (Self::Open, LifeCycleState::Open)
                | (Self::Closing, LifeCycleState::Closing)
                | (Self::QuasiClosed, LifeCycleState::QuasiClosed)
                | (Self::Closed, LifeCycleState::Closed)
        )
    }
}

impl Display for ReplicaState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::QuasiClosed => "QUASI_CLOSED",
            Self::Closed => "CLOSED",
            Self::Unhealthy => "UNHEALTHY",
        };
        f.write_str(s)
    }
}

/// Metadata for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInfo {
    /// The container id.
    pub id: ContainerId,
    /// Current lifecycle state.
    pub state: LifeCycleState,
    /// Required number of replicas.
    pub replication_factor: usize,
    /// Bytes stored in the container.
    pub used_bytes: u64,
    /// Number of keys stored in the container.
    pub key_count: u64,
    /// The pipeline the container was written through.
    pub pipeline: PipelineId,
    /// The last sequence id committed to the container.
    pub sequence_id: SequenceNumber,
}

impl ContainerInfo {
    /// Copy of this container with a different lifecycle state.
    pub fn with_state(&self, state: LifeCycleState) -> Self {
        Self { state, ..*self }
    }
}

/// One instance of a container hosted on one datanode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerReplica {
    /// The container this replica belongs to.
    pub container_id: ContainerId,
    /// The datanode currently hosting the replica.
    pub datanode: DatanodeDetails,
    /// Replica state as last reported.
    pub state: ReplicaState,
    /// Bytes stored in the replica.
    pub bytes_used: u64,
    /// Number of keys stored in the replica.
    pub key_count: u64,
    /// The last sequence id committed to the replica.
    pub sequence_id: SequenceNumber,
    /// The datanode this replica's lineage originated on. Not necessarily
    /// the current host.
    pub origin_datanode_id: DatanodeId,
}
