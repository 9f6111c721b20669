//! Construction and dispatch of datanode commands.

use crate::interface::{ContainerToken, Event, EventPublisher, ScmContext};
use data_types::{ContainerId, DatanodeDetails, PipelineId};
use observability_deps::tracing::debug;
use std::sync::Arc;

/// A command for one datanode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatanodeCommand {
    /// Close a container replica, optionally forcing a divergent
    /// quasi-closed replica shut.
    CloseContainer {
        /// The container to close.
        container: ContainerId,
        /// The pipeline the container was written through.
        pipeline: PipelineId,
        /// Close even without pipeline consensus.
        force: bool,
    },
    /// Fetch a container replica from one of `sources`.
    ReplicateContainer {
        /// The container to replicate.
        container: ContainerId,
        /// Candidate datanodes to copy from, best first.
        sources: Vec<DatanodeDetails>,
    },
    /// Delete a container replica.
    DeleteContainer {
        /// The container to delete.
        container: ContainerId,
        /// Delete even a non-empty or mismatched replica.
        force: bool,
    },
}

/// A [`DatanodeCommand`] stamped with its addressing and authorization
/// context, ready for the event bus.
///
/// Datanodes ignore envelopes from superseded terms, so a deposed leader's
/// stragglers are harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    /// The datanode the command is addressed to.
    pub target: DatanodeDetails,
    /// The leader term observed when the command was issued.
    pub term: u64,
    /// Authorizes the datanode to act on the container.
    pub token: ContainerToken,
    /// The command itself.
    pub command: DatanodeCommand,
}

/// Stamps commands with the current leader term and hands them to the event
/// bus.
///
/// Dispatch is fire-and-forget: the bus delivers asynchronously and
/// completion is only ever observed through replica reports.
#[derive(Debug)]
pub struct CommandDispatcher {
    context: Arc<dyn ScmContext>,
    publisher: Arc<dyn EventPublisher>,
}

impl CommandDispatcher {
    /// Create a new `CommandDispatcher`.
    pub fn new(context: Arc<dyn ScmContext>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { context, publisher }
    }

    /// Send `command` to `target`, stamped with the current term.
    ///
    /// Returns `false` without publishing anything when this SCM is not the
    /// leader; callers must skip their bookkeeping in that case.
    pub fn dispatch(
        &self,
        container: ContainerId,
        target: &DatanodeDetails,
        command: DatanodeCommand,
    ) -> bool {
        let term = match self.context.term_of_leader() {
            Ok(term) => term,
            Err(_) => {
                debug!(
                    container=%container,
                    target=%target,
                    "not the leader, skipping command dispatch"
                );
                return false;
            }
        };

        self.publisher.fire(Event::DatanodeCommand(CommandEnvelope {
            target: target.clone(),
            term,
            token: self.context.container_token(container),
            command,
        }));
        true
    }

    /// Ask the close-container handler to start closing `container`.
    pub fn publish_close_event(&self, container: ContainerId) {
        self.publisher.fire(Event::CloseContainer(container));
    }
}
