//! User-requested replica moves.
//!
//! A move is replicate-then-delete: the target replica is created
//! unconditionally once the preconditions hold, but the source replica is
//! only deleted if doing so cannot worsen placement. The caller's future
//! resolves exactly once with a [`MoveResult`].

use crate::interface::{ContainerError, NodeNotFoundError};
use crate::move_scheduler::{MovePair, MoveScheduler};
use data_types::{ContainerId, ContainerInfo, ContainerReplica, DatanodeDetails, LifeCycleState};
use observability_deps::tracing::{debug, info, warn};
use snafu::Snafu;
use tokio::sync::oneshot;

use crate::inflight::InflightRemoval;
use crate::manager::ReplicationManager;

/// Terminal outcome of a move request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveResult {
    Completed,
    FailNotRunning,
    FailNotLeader,
    ReplicationFailNotExistInSource,
    ReplicationFailExistInTarget,
    ReplicationFailContainerNotClosed,
    ReplicationFailInflightDeletion,
    ReplicationFailInflightReplication,
    ReplicationFailTimeOut,
    ReplicationFailNodeNotInService,
    ReplicationFailNodeUnhealthy,
    DeletionFailNodeNotInService,
    DeletionFailTimeOut,
    DeletionFailNodeUnhealthy,
    DeleteFailPolicy,
    PlacementPolicyNotSatisfied,
    UnexpectedRemoveSourceAtInflightReplication,
    UnexpectedRemoveTargetAtInflightDeletion,
    FailCanNotRecordToDb,
}

impl MoveResult {
    /// Stable label, used as a metric attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::FailNotRunning => "fail_not_running",
            Self::FailNotLeader => "fail_not_leader",
            Self::ReplicationFailNotExistInSource => "replication_fail_not_exist_in_source",
            Self::ReplicationFailExistInTarget => "replication_fail_exist_in_target",
            Self::ReplicationFailContainerNotClosed => "replication_fail_container_not_closed",
            Self::ReplicationFailInflightDeletion => "replication_fail_inflight_deletion",
            Self::ReplicationFailInflightReplication => "replication_fail_inflight_replication",
            Self::ReplicationFailTimeOut => "replication_fail_time_out",
            Self::ReplicationFailNodeNotInService => "replication_fail_node_not_in_service",
            Self::ReplicationFailNodeUnhealthy => "replication_fail_node_unhealthy",
            Self::DeletionFailNodeNotInService => "deletion_fail_node_not_in_service",
            Self::DeletionFailTimeOut => "deletion_fail_time_out",
            Self::DeletionFailNodeUnhealthy => "deletion_fail_node_unhealthy",
            Self::DeleteFailPolicy => "delete_fail_policy",
            Self::PlacementPolicyNotSatisfied => "placement_policy_not_satisfied",
            Self::UnexpectedRemoveSourceAtInflightReplication => {
                "unexpected_remove_source_at_inflight_replication"
            }
            Self::UnexpectedRemoveTargetAtInflightDeletion => {
                "unexpected_remove_target_at_inflight_deletion"
            }
            Self::FailCanNotRecordToDb => "fail_can_not_record_to_db",
        }
    }
}

impl std::fmt::Display for MoveResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A move request could not even be evaluated.
#[derive(Debug, Snafu)]
pub enum MoveError {
    #[snafu(context(false), display("{}", source))]
    Container { source: ContainerError },

    #[snafu(context(false), display("{}", source))]
    Node { source: NodeNotFoundError },
}

/// Resolves with the move's terminal [`MoveResult`].
pub type MoveFuture = oneshot::Receiver<MoveResult>;

impl ReplicationManager {
    /// Move one replica of `container` from `src` to `tgt`.
    ///
    /// Precondition failures resolve the returned future immediately;
    /// unknown containers or datanodes fail the call itself.
    pub async fn move_container(
        &self,
        container: ContainerId,
        src: DatanodeDetails,
        tgt: DatanodeDetails,
    ) -> Result<MoveFuture, MoveError> {
        let (sender, receiver) = oneshot::channel();
        macro_rules! reject {
            ($result:expr) => {{
                debug!(container=%container, result=%$result, "move rejected");
                self.metrics.record_move_result($result);
                let _ = sender.send($result);
                return Ok(receiver);
            }};
        }

        if !self.is_running() {
            reject!(MoveResult::FailNotRunning);
        }
        if !self.context.is_leader() {
            reject!(MoveResult::FailNotLeader);
        }

        let src_status = self.nodes.node_status(&src)?;
        let tgt_status = self.nodes.node_status(&tgt)?;
        if !src_status.is_healthy() || !tgt_status.is_healthy() {
            reject!(MoveResult::ReplicationFailNodeUnhealthy);
        }
        if !src_status.is_in_service() || !tgt_status.is_in_service() {
            reject!(MoveResult::ReplicationFailNodeNotInService);
        }

        let lock = self.locks.get(container);
        let _guard = lock.lock().await;

        let info = self.containers.container(container)?;
        let replicas = self.containers.container_replicas(container)?;
        if replicas.iter().any(|r| r.datanode == tgt) {
            reject!(MoveResult::ReplicationFailExistInTarget);
        }
        if !replicas.iter().any(|r| r.datanode == src) {
            reject!(MoveResult::ReplicationFailNotExistInSource);
        }
        if self.inflight_replication.contains(container) {
            reject!(MoveResult::ReplicationFailInflightReplication);
        }
        if self.inflight_deletion.contains(container) {
            reject!(MoveResult::ReplicationFailInflightDeletion);
        }
        if info.state != LifeCycleState::Closed {
            reject!(MoveResult::ReplicationFailContainerNotClosed);
        }

        // the placement the cluster will have once the move is done
        let mut proposed: Vec<DatanodeDetails> = replicas
            .iter()
            .filter(|r| r.datanode != src)
            .map(|r| r.datanode.clone())
            .collect();
        proposed.push(tgt.clone());
        let status = self
            .placement
            .validate(&proposed, info.replication_factor);
        if !status.is_policy_satisfied() {
            reject!(MoveResult::PlacementPolicyNotSatisfied);
        }

        if let Err(e) = self
            .move_scheduler
            .start_move(
                container,
                MovePair {
                    src: src.clone(),
                    tgt: tgt.clone(),
                },
            )
            .await
        {
            warn!(container=%container, %e, "could not record move");
            reject!(MoveResult::FailCanNotRecordToDb);
        }

        info!(container=%container, src=%src, tgt=%tgt, "move started");
        self.move_futures.lock().insert(container, sender);
        self.send_replicate_command(&info, &tgt, vec![src]);
        Ok(receiver)
    }

    /// Resolve the registered future for `container`, if any. The entry is
    /// removed atomically with resolving it, so a racing second resolution
    /// sees absence and becomes a no-op.
    pub(crate) fn complete_move_future(&self, container: ContainerId, result: MoveResult) {
        let sender = self.move_futures.lock().remove(&container);
        self.metrics.record_move_result(result);
        if let Some(sender) = sender {
            if sender.send(result).is_err() {
                debug!(container=%container, "move caller went away before the result");
            }
        }
    }

    /// Terminate the move for `container`: resolve its future and drop the
    /// replicated record.
    pub(crate) async fn finish_move(&self, container: ContainerId, result: MoveResult) {
        self.complete_move_future(container, result);
        if let Err(e) = self.move_scheduler.complete_move(container).await {
            warn!(container=%container, %e, "could not clear finished move from the move table");
        }
    }

    /// Hook invoked by inflight reconciliation for every removed entry that
    /// might belong to an active move.
    pub(crate) async fn update_move_on_removal(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
        removal: &InflightRemoval,
        is_inflight_replication: bool,
    ) {
        let Some(pair) = self.move_scheduler.get_move(container.id) else {
            return;
        };
        let datanode = &removal.action.datanode;
        let is_source = pair.src == *datanode;
        let is_target = pair.tgt == *datanode;
        if !is_source && !is_target {
            return;
        }

        // A restored leader has the move record but no futures; resolution
        // quietly degrades to clearing the record.
        if is_source && is_inflight_replication {
            self.finish_move(
                container.id,
                MoveResult::UnexpectedRemoveSourceAtInflightReplication,
            )
            .await;
            return;
        }
        if is_target && !is_inflight_replication {
            self.finish_move(
                container.id,
                MoveResult::UnexpectedRemoveTargetAtInflightDeletion,
            )
            .await;
            return;
        }

        // On either leg a completed removal wins over whatever the node
        // status says: the expected replica change was observed, so the leg
        // succeeded even if the node degraded in the same pass.
        if is_inflight_replication && removal.completed {
            // the target replica landed; decide whether the source can go
            self.delete_source_for_move(container, replicas).await;
            return;
        }
        if !is_inflight_replication && removal.completed {
            // the source replica is gone; the move is done
            self.finish_move(container.id, MoveResult::Completed).await;
            return;
        }

        let result = if is_inflight_replication {
            if removal.unhealthy {
                MoveResult::ReplicationFailNodeUnhealthy
            } else if removal.not_in_service {
                MoveResult::ReplicationFailNodeNotInService
            } else {
                MoveResult::ReplicationFailTimeOut
            }
        } else if removal.unhealthy {
            MoveResult::DeletionFailNodeUnhealthy
        } else if removal.timed_out {
            MoveResult::DeletionFailTimeOut
        } else {
            MoveResult::DeletionFailNodeNotInService
        };
        self.finish_move(container.id, result).await;
    }

    /// The conservative half of a move: the source replica is only deleted
    /// while the container is over-replicated and the placement without the
    /// source is no worse than with it.
    pub(crate) async fn delete_source_for_move(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) {
        let Some(pair) = self.move_scheduler.get_move(container.id) else {
            return;
        };

        if !replicas.iter().any(|r| r.datanode == pair.src) {
            // the source vanished by other means; the move still ended with
            // the data where it was asked to be
            self.finish_move(container.id, MoveResult::Completed).await;
            return;
        }

        let count = self.replica_count(container, replicas);
        let current: Vec<DatanodeDetails> = replicas.iter().map(|r| r.datanode.clone()).collect();
        let without: Vec<DatanodeDetails> = replicas
            .iter()
            .filter(|r| r.datanode != pair.src)
            .map(|r| r.datanode.clone())
            .collect();
        let before = self
            .placement
            .validate(&current, container.replication_factor);
        let after = self
            .placement
            .validate(&without, container.replication_factor);

        if count.is_over_replicated() && before.actually_equal(&after) {
            self.send_delete_command(container, &pair.src, true);
        } else {
            info!(
                container=%container.id,
                src=%pair.src,
                "keeping the moved-from replica, deleting it would hurt placement"
            );
            self.finish_move(container.id, MoveResult::DeleteFailPolicy)
                .await;
        }
    }

    /// Recover the moves persisted by previous leaders. Runs once per
    /// leader-readiness transition, after the move table has been reloaded.
    pub(crate) async fn on_leader_ready(&self) {
        self.move_scheduler.reinitialize();
        let moves = self.move_scheduler.inflight_moves();
        if moves.is_empty() {
            return;
        }
        info!(count = moves.len(), "recovering in-progress moves");

        for (id, pair) in moves {
            let (container, replicas) = match (
                self.containers.container(id),
                self.containers.container_replicas(id),
            ) {
                (Ok(container), Ok(replicas)) => (container, replicas),
                _ => {
                    warn!(container=%id, "dropping recovered move for a missing container");
                    self.finish_move(id, MoveResult::Completed).await;
                    continue;
                }
            };

            let src_present = replicas.iter().any(|r| r.datanode == pair.src);
            let tgt_present = replicas.iter().any(|r| r.datanode == pair.tgt);
            if src_present && tgt_present {
                self.delete_source_for_move(&container, &replicas).await;
            } else if src_present {
                self.send_replicate_command(&container, &pair.tgt, vec![pair.src.clone()]);
            } else {
                // without a source replica the move is superseded; whatever
                // replicas exist now are the manager's to reconcile normally
                self.finish_move(id, MoveResult::Completed).await;
            }
        }
    }
}
