//! The SCM Replication Manager.
//!
//! Drives every storage container toward its desired replication state:
//! closing containers whose replicas diverge, creating replicas for
//! under-replicated containers, trimming over-replicated ones, and executing
//! user-requested replica moves with at-most-once completion semantics.
//!
//! The manager only reads cluster state and emits commands; the container
//! metadata store, node manager, placement policy, event bus and consensus
//! layer are external collaborators expressed as traits (see
//! [`ContainerManager`], [`NodeManager`], [`PlacementPolicy`],
//! [`EventPublisher`], [`ScmContext`], [`Consensus`]), with in-memory
//! implementations in [`mock`].

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod command;
mod config;
mod inflight;
mod interface;
mod lock;
mod manager;
mod metrics;
pub mod mock;
mod move_scheduler;
mod moves;
mod placement;
mod replica_count;

pub use command::{CommandDispatcher, CommandEnvelope, DatanodeCommand};
pub use config::ReplicationConfig;
pub use inflight::{InflightAction, InflightRemoval};
pub use interface::{
    ContainerError, ContainerManager, ContainerToken, Event, EventPublisher, NodeManager,
    NodeNotFoundError, NotLeaderError, PlacementError, PlacementPolicy, ScmContext,
};
pub use manager::{run_replication_monitor, ReplicationManager};
pub use metrics::ReplicationMetrics;
pub use move_scheduler::{
    Consensus, ConsensusError, MoveOp, MovePair, MoveScheduler, MoveTable,
    ReplicatedMoveScheduler, TransactionBuffer,
};
pub use moves::{MoveError, MoveFuture, MoveResult};
pub use placement::PlacementStatus;
pub use replica_count::{is_container_empty, ReplicaCount};
