//! Interfaces of the external collaborators the replication manager drives.
//!
//! The SCM owns the container metadata store, node manager, placement policy,
//! event bus and leadership state; the replication manager only consumes
//! them. Keeping these as narrow traits also allows easy mocking (see
//! [`crate::mock`]).

use crate::command::CommandEnvelope;
use crate::placement::PlacementStatus;
use data_types::{
    ContainerId, ContainerInfo, ContainerReplica, DatanodeDetails, DatanodeId, LifeCycleEvent,
    LifeCycleState, NodeStatus,
};
use snafu::Snafu;
use std::fmt::Debug;

/// Errors surfaced by the [`ContainerManager`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ContainerError {
    #[snafu(display("container {} not found", id))]
    ContainerNotFound { id: ContainerId },

    #[snafu(display("container {} cannot apply {:?} while in state {}", id, event, state))]
    InvalidStateTransition {
        id: ContainerId,
        event: LifeCycleEvent,
        state: LifeCycleState,
    },
}

/// Error returned when a datanode is unknown to the [`NodeManager`].
#[derive(Debug, Snafu)]
#[snafu(display("datanode {} is not registered with the node manager", id))]
#[snafu(visibility(pub))]
pub struct NodeNotFoundError {
    /// The unknown datanode.
    pub id: DatanodeId,
}

/// Errors surfaced by the [`PlacementPolicy`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PlacementError {
    #[snafu(display("could not choose {} datanodes: {}", required, reason))]
    NotEnoughNodes { required: usize, reason: String },
}

/// Error returned when a term is requested from a non-leader SCM.
#[derive(Debug, Snafu)]
#[snafu(display("this SCM is not the current leader"))]
pub struct NotLeaderError;

/// Read and update access to container metadata.
///
/// Reads return point-in-time snapshots; the store may change under the
/// caller at any time.
pub trait ContainerManager: Debug + Send + Sync {
    /// All known containers.
    fn containers(&self) -> Vec<ContainerInfo>;

    /// Look up a single container.
    fn container(&self, id: ContainerId) -> Result<ContainerInfo, ContainerError>;

    /// The currently known replicas of a container.
    fn container_replicas(&self, id: ContainerId)
        -> Result<Vec<ContainerReplica>, ContainerError>;

    /// Advance the container's lifecycle state.
    fn update_container_state(
        &self,
        id: ContainerId,
        event: LifeCycleEvent,
    ) -> Result<(), ContainerError>;
}

/// Access to the administrative and liveness state of datanodes.
pub trait NodeManager: Debug + Send + Sync {
    /// The status of a datanode.
    fn node_status(&self, datanode: &DatanodeDetails) -> Result<NodeStatus, NodeNotFoundError>;
}

/// The pluggable container placement policy.
pub trait PlacementPolicy: Debug + Send + Sync {
    /// Judge whether hosting replicas on `replicas` satisfies the policy for
    /// a container requiring `replication_factor` copies.
    fn validate(&self, replicas: &[DatanodeDetails], replication_factor: usize)
        -> PlacementStatus;

    /// Choose `required` datanodes for new replicas, avoiding `exclude`.
    /// `size_hint` is the expected replica size in bytes.
    fn choose(
        &self,
        exclude: &[DatanodeDetails],
        required: usize,
        size_hint: u64,
    ) -> Result<Vec<DatanodeDetails>, PlacementError>;
}

/// Events the replication manager publishes onto the SCM event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Ask the close-container handler to start closing a container.
    CloseContainer(ContainerId),
    /// A command addressed to one datanode.
    DatanodeCommand(CommandEnvelope),
}

/// The SCM event bus. Delivery is asynchronous and never acknowledged
/// through this interface; completion is observed via replica reports.
pub trait EventPublisher: Debug + Send + Sync {
    /// Publish an event. Must not block.
    fn fire(&self, event: Event);
}

/// Opaque authorization token attached to outbound container commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerToken(String);

impl ContainerToken {
    /// Wrap an encoded token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The encoded token.
    pub fn get(&self) -> &str {
        &self.0
    }
}

/// Leadership and lifecycle state of the SCM this manager runs inside.
pub trait ScmContext: Debug + Send + Sync {
    /// This SCM currently holds leadership.
    fn is_leader(&self) -> bool;

    /// Leadership is held and the state machine has caught up.
    fn is_leader_ready(&self) -> bool;

    /// The SCM is still in startup safe mode.
    fn is_in_safe_mode(&self) -> bool;

    /// The current leader term. Fails when this SCM is not the leader.
    fn term_of_leader(&self) -> Result<u64, NotLeaderError>;

    /// Generate a container token for an outbound command.
    fn container_token(&self, id: ContainerId) -> ContainerToken;
}
