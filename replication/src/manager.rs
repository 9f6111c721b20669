//! The replication manager and its periodic monitor.
//!
//! One [`ReplicationManager`] instance runs inside each SCM. Only the ready
//! leader acts: followers keep the manager constructed but
//! [`ReplicationManager::should_run`] stays false until leadership and
//! safe-mode exit are signalled through
//! [`ReplicationManager::notify_status_changed`].

use crate::command::{CommandDispatcher, DatanodeCommand};
use crate::config::ReplicationConfig;
use crate::inflight::{InflightAction, InflightMap};
use crate::interface::{
    ContainerError, ContainerManager, EventPublisher, NodeManager, PlacementPolicy, ScmContext,
};
use crate::lock::ContainerLocks;
use crate::metrics::ReplicationMetrics;
use crate::move_scheduler::{MovePair, MoveScheduler};
use crate::moves::MoveResult;
use crate::placement::PlacementStatus;
use crate::replica_count::{is_container_empty, ReplicaCount};
use data_types::{
    ContainerId, ContainerInfo, ContainerReplica, DatanodeDetails, LifeCycleEvent, LifeCycleState,
    NodeStatus, ReplicaState, SequenceNumber,
};
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use scm_time::{Time, TimeProvider};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Drives every container toward its desired replication state.
#[derive(Debug)]
pub struct ReplicationManager {
    pub(crate) config: ReplicationConfig,
    pub(crate) containers: Arc<dyn ContainerManager>,
    pub(crate) nodes: Arc<dyn NodeManager>,
    pub(crate) placement: Arc<dyn PlacementPolicy>,
    pub(crate) context: Arc<dyn ScmContext>,
    pub(crate) dispatcher: CommandDispatcher,
    pub(crate) move_scheduler: Arc<dyn MoveScheduler>,
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    pub(crate) metrics: ReplicationMetrics,

    /// Pending replicate commands, keyed by container.
    pub(crate) inflight_replication: InflightMap,
    /// Pending delete commands, keyed by container.
    pub(crate) inflight_deletion: InflightMap,
    /// Callers waiting for a move to finish. An entry is removed atomically
    /// with resolving it, so every future resolves at most once.
    pub(crate) move_futures: Mutex<HashMap<ContainerId, oneshot::Sender<MoveResult>>>,

    pub(crate) locks: ContainerLocks,

    running: AtomicBool,
    service_ready: AtomicBool,
    ready_since: Mutex<Option<Time>>,
    monitor: Mutex<Option<CancellationToken>>,
}

impl ReplicationManager {
    /// Construct a manager wired to its external collaborators. Call
    /// [`start`](Self::start) to launch the monitor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReplicationConfig,
        containers: Arc<dyn ContainerManager>,
        nodes: Arc<dyn NodeManager>,
        placement: Arc<dyn PlacementPolicy>,
        publisher: Arc<dyn EventPublisher>,
        context: Arc<dyn ScmContext>,
        move_scheduler: Arc<dyn MoveScheduler>,
        metric_registry: &metric::Registry,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            containers,
            nodes,
            placement,
            dispatcher: CommandDispatcher::new(Arc::clone(&context), publisher),
            context,
            move_scheduler,
            time_provider,
            metrics: ReplicationMetrics::new(metric_registry),
            inflight_replication: InflightMap::default(),
            inflight_deletion: InflightMap::default(),
            move_futures: Mutex::new(HashMap::new()),
            locks: ContainerLocks::default(),
            running: AtomicBool::new(false),
            service_ready: AtomicBool::new(false),
            ready_since: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    /// Launch the replication monitor.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("replication monitor already running");
            return;
        }
        info!("starting replication monitor");

        let shutdown = CancellationToken::new();
        let manager = Arc::clone(self);
        let token = shutdown.clone();
        let monitor = tokio::spawn(async move { run_replication_monitor(manager, token).await });

        // A panic escaping the monitor must take the process down with exit
        // code 1, never leave cluster-wide reconciliation silently stalled.
        tokio::spawn(async move {
            if let Err(e) = monitor.await {
                if e.is_panic() {
                    error!(%e, "replication monitor panicked, terminating");
                    std::process::exit(1);
                }
            }
        });

        *self.monitor.lock() = Some(shutdown);
    }

    /// Stop the monitor and drop all inflight bookkeeping. Registered move
    /// futures are left unresolved; the next ready leader recovers them from
    /// the move table.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("replication monitor not running");
            return;
        }
        info!("stopping replication monitor");
        if let Some(shutdown) = self.monitor.lock().take() {
            shutdown.cancel();
        }
        self.inflight_replication.clear();
        self.inflight_deletion.clear();
    }

    /// Whether [`start`](Self::start) has been called without a matching
    /// [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Re-read leadership and safe-mode state. On the transition to "ready
    /// leader out of safe mode" this recovers the moves persisted by prior
    /// leaders.
    pub async fn notify_status_changed(&self) {
        let ready = self.context.is_leader_ready() && !self.context.is_in_safe_mode();
        let was_ready = self.service_ready.swap(ready, Ordering::SeqCst);

        if ready && !was_ready {
            *self.ready_since.lock() = Some(self.time_provider.now());
            info!("replication manager status: running");
            self.on_leader_ready().await;
        } else if !ready && was_ready {
            *self.ready_since.lock() = None;
            info!("replication manager status: paused");
        }
    }

    /// Whether the monitor may act: this SCM is the ready leader, out of
    /// safe mode, and the post-safe-mode grace period has elapsed.
    pub fn should_run(&self) -> bool {
        if !self.service_ready.load(Ordering::SeqCst) {
            return false;
        }
        let Some(since) = *self.ready_since.lock() else {
            return false;
        };
        self.time_provider
            .now()
            .checked_duration_since(since)
            .map(|elapsed| elapsed >= self.config.safe_mode_exit_grace())
            .unwrap_or(false)
    }

    /// Process every known container once. This is the body of one monitor
    /// cycle, also exposed directly so tests can drive cycles explicitly.
    pub async fn process_all(&self) {
        for container in self.containers.containers() {
            if let Err(e) = self.process_container(&container).await {
                match e {
                    ContainerError::ContainerNotFound { id } => {
                        warn!(container=%id, "container disappeared mid-cycle, skipping");
                    }
                    e => warn!(container=%container.id, %e, "failed to process container"),
                }
            }
        }
        self.metrics
            .inflight_replication
            .set(self.inflight_replication.total_len() as u64);
        self.metrics
            .inflight_deletion
            .set(self.inflight_deletion.total_len() as u64);
    }

    /// Run the per-container decision procedure once, under the container's
    /// mutex.
    pub async fn process_container(&self, container: &ContainerInfo) -> Result<(), ContainerError> {
        let lock = self.locks.get(container.id);
        let _guard = lock.lock().await;

        let replicas = self.containers.container_replicas(container.id)?;

        match container.state {
            LifeCycleState::Open => {
                if !replicas.iter().all(|r| r.state == ReplicaState::Open) {
                    info!(container=%container.id, "open container has non-open replicas, requesting close");
                    self.dispatcher.publish_close_event(container.id);
                }
                return Ok(());
            }
            LifeCycleState::Closing => {
                for replica in &replicas {
                    self.send_close_command(container, &replica.datanode, false);
                }
                return Ok(());
            }
            LifeCycleState::QuasiClosed => {
                if self.can_force_close(container, &replicas) {
                    self.force_close(container, &replicas);
                    return Ok(());
                }
            }
            _ => {}
        }

        self.reconcile_inflight_replication(container, &replicas)
            .await;
        self.reconcile_inflight_deletion(container, &replicas).await;

        match container.state {
            LifeCycleState::Deleting => return self.handle_under_delete(container, &replicas),
            LifeCycleState::Deleted => return Ok(()),
            _ => {}
        }

        if is_container_empty(container, &replicas) {
            return self.delete_empty_container(container, &replicas);
        }

        let count = self.replica_count(container, &replicas);
        let placement = self.placement_status(&replicas, container.replication_factor);
        if !count.is_sufficiently_replicated() || !placement.is_policy_satisfied() {
            self.handle_under_replicated(container, &replicas, &count);
        } else if count.is_over_replicated() {
            self.handle_over_replicated(container, &replicas, &count);
        } else if !count.is_healthy() {
            self.handle_unstable(container, &replicas);
        }
        Ok(())
    }

    /// Classify the container's replica set, see [`ReplicaCount`].
    pub fn container_replica_count(
        &self,
        id: ContainerId,
    ) -> Result<ReplicaCount, ContainerError> {
        let container = self.containers.container(id)?;
        let replicas = self.containers.container_replicas(id)?;
        Ok(self.replica_count(&container, &replicas))
    }

    /// Whether any replicate or delete command is pending for the container.
    pub fn is_container_replicating_or_deleting(&self, id: ContainerId) -> bool {
        self.inflight_replication.contains(id) || self.inflight_deletion.contains(id)
    }

    /// Snapshot of the pending replicate commands.
    pub fn inflight_replication(&self) -> HashMap<ContainerId, Vec<InflightAction>> {
        self.inflight_replication.snapshot()
    }

    /// Snapshot of the pending delete commands.
    pub fn inflight_deletion(&self) -> HashMap<ContainerId, Vec<InflightAction>> {
        self.inflight_deletion.snapshot()
    }

    /// Snapshot of the moves currently in progress.
    pub fn inflight_move(&self) -> BTreeMap<ContainerId, MovePair> {
        self.move_scheduler.inflight_moves()
    }

    /// The manager's metrics.
    pub fn metrics(&self) -> &ReplicationMetrics {
        &self.metrics
    }

    pub(crate) fn replica_count(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) -> ReplicaCount {
        let with_status: Vec<(ContainerReplica, NodeStatus)> = replicas
            .iter()
            .filter_map(|replica| match self.nodes.node_status(&replica.datanode) {
                Ok(status) => Some((replica.clone(), status)),
                Err(e) => {
                    debug!(container=%container.id, %e, "ignoring replica on unknown datanode");
                    None
                }
            })
            .collect();
        ReplicaCount::new(
            container,
            &with_status,
            self.inflight_replication.len_for(container.id),
            self.inflight_deletion.len_for(container.id),
            self.config.maintenance_replica_minimum(),
        )
    }

    pub(crate) fn placement_status(
        &self,
        replicas: &[ContainerReplica],
        replication_factor: usize,
    ) -> PlacementStatus {
        let datanodes: Vec<DatanodeDetails> =
            replicas.iter().map(|r| r.datanode.clone()).collect();
        self.placement.validate(&datanodes, replication_factor)
    }

    // ---- command issue paths ------------------------------------------------

    pub(crate) fn send_close_command(
        &self,
        container: &ContainerInfo,
        target: &DatanodeDetails,
        force: bool,
    ) {
        if self.dispatcher.dispatch(
            container.id,
            target,
            DatanodeCommand::CloseContainer {
                container: container.id,
                pipeline: container.pipeline,
                force,
            },
        ) {
            self.metrics.close_sent.inc(1);
        }
    }

    pub(crate) fn send_replicate_command(
        &self,
        container: &ContainerInfo,
        target: &DatanodeDetails,
        sources: Vec<DatanodeDetails>,
    ) {
        if self.dispatcher.dispatch(
            container.id,
            target,
            DatanodeCommand::ReplicateContainer {
                container: container.id,
                sources,
            },
        ) {
            info!(container=%container.id, target=%target, "replicate container command issued");
            self.inflight_replication.record(
                container.id,
                InflightAction {
                    datanode: target.clone(),
                    issued_at: self.time_provider.now(),
                },
            );
            self.metrics.replicate_sent.inc(1);
        }
    }

    pub(crate) fn send_delete_command(
        &self,
        container: &ContainerInfo,
        target: &DatanodeDetails,
        force: bool,
    ) {
        if self.dispatcher.dispatch(
            container.id,
            target,
            DatanodeCommand::DeleteContainer {
                container: container.id,
                force,
            },
        ) {
            info!(container=%container.id, target=%target, "delete container command issued");
            self.inflight_deletion.record(
                container.id,
                InflightAction {
                    datanode: target.clone(),
                    issued_at: self.time_provider.now(),
                },
            );
            self.metrics.delete_sent.inc(1);
        }
    }

    // ---- inflight reconciliation -------------------------------------------

    async fn reconcile_inflight_replication(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) {
        let removals = self.inflight_replication.reconcile(
            container.id,
            self.time_provider.now(),
            self.config.event_timeout(),
            |action| replicas.iter().any(|r| r.datanode == action.datanode),
            |datanode| self.nodes.node_status(datanode).ok(),
        );
        for removal in removals {
            if !removal.node_known {
                continue;
            }
            if removal.timed_out {
                warn!(
                    container=%container.id,
                    target=%removal.action.datanode,
                    "replicate command timed out"
                );
                self.metrics.replicate_timeout.inc(1);
            } else if removal.completed {
                self.metrics.replicate_completed.inc(1);
                self.metrics
                    .replicate_bytes_completed
                    .inc(container.used_bytes);
            }
            self.update_move_on_removal(container, replicas, &removal, true)
                .await;
        }
    }

    async fn reconcile_inflight_deletion(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) {
        let removals = self.inflight_deletion.reconcile(
            container.id,
            self.time_provider.now(),
            self.config.event_timeout(),
            |action| !replicas.iter().any(|r| r.datanode == action.datanode),
            |datanode| self.nodes.node_status(datanode).ok(),
        );
        for removal in removals {
            if !removal.node_known {
                continue;
            }
            if removal.timed_out {
                warn!(
                    container=%container.id,
                    target=%removal.action.datanode,
                    "delete command timed out"
                );
                self.metrics.delete_timeout.inc(1);
            } else if removal.completed {
                self.metrics.delete_completed.inc(1);
                self.metrics.delete_bytes_completed.inc(container.used_bytes);
            }
            self.update_move_on_removal(container, replicas, &removal, false)
                .await;
        }
    }

    // ---- per-state handlers ------------------------------------------------

    fn can_force_close(&self, container: &ContainerInfo, replicas: &[ContainerReplica]) -> bool {
        let distinct_origins: HashSet<_> = replicas
            .iter()
            .filter(|r| r.state == ReplicaState::QuasiClosed)
            .map(|r| r.origin_datanode_id)
            .collect();
        distinct_origins.len() > container.replication_factor / 2
    }

    /// Force-close every quasi-closed replica carrying the highest observed
    /// sequence id; the laggards get cleaned up as unstable later.
    fn force_close(&self, container: &ContainerInfo, replicas: &[ContainerReplica]) {
        let max_sequence = replicas
            .iter()
            .filter(|r| r.state == ReplicaState::QuasiClosed)
            .map(|r| r.sequence_id)
            .max()
            .unwrap_or(SequenceNumber::NONE);
        if max_sequence == SequenceNumber::NONE {
            return;
        }
        for replica in replicas
            .iter()
            .filter(|r| r.state == ReplicaState::QuasiClosed && r.sequence_id == max_sequence)
        {
            info!(
                container=%container.id,
                target=%replica.datanode,
                sequence=%max_sequence,
                "force closing quasi-closed replica"
            );
            self.send_close_command(container, &replica.datanode, true);
        }
    }

    fn handle_under_delete(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) -> Result<(), ContainerError> {
        if replicas.is_empty() {
            info!(container=%container.id, "all replicas deleted, cleaning up container");
            return self
                .containers
                .update_container_state(container.id, LifeCycleEvent::Cleanup);
        }
        for replica in replicas {
            if !self
                .inflight_deletion
                .contains_datanode(container.id, &replica.datanode)
            {
                self.send_delete_command(container, &replica.datanode, false);
            }
        }
        Ok(())
    }

    fn delete_empty_container(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) -> Result<(), ContainerError> {
        info!(container=%container.id, "deleting empty container");
        for replica in replicas {
            self.send_delete_command(container, &replica.datanode, false);
        }
        self.containers
            .update_container_state(container.id, LifeCycleEvent::Delete)
    }

    fn handle_under_replicated(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
        count: &ReplicaCount,
    ) {
        let deletion_targets = self.inflight_deletion.datanodes(container.id);
        let mut source_replicas: Vec<&ContainerReplica> = replicas
            .iter()
            .filter(|r| {
                matches!(r.state, ReplicaState::QuasiClosed | ReplicaState::Closed)
            })
            .filter(|r| !deletion_targets.contains(&r.datanode))
            .filter(|r| {
                self.nodes
                    .node_status(&r.datanode)
                    .map(|status| status.is_healthy())
                    .unwrap_or(false)
            })
            .collect();
        if source_replicas.is_empty() {
            warn!(container=%container.id, "cannot replicate container, no healthy source replica");
            return;
        }
        source_replicas.sort_by(|a, b| b.sequence_id.cmp(&a.sequence_id));
        let sources: Vec<DatanodeDetails> = source_replicas
            .iter()
            .map(|r| r.datanode.clone())
            .collect();

        let replication_targets = self.inflight_replication.datanodes(container.id);
        let rep_delta = count.additional_replica_needed().max(0) as usize;

        // mis-replication judged over where the data will be once pending
        // adds land
        let mut placed = sources.clone();
        placed.extend(replication_targets.iter().cloned());
        let mis_delta = self
            .placement
            .validate(&placed, container.replication_factor)
            .mis_replication_count();

        let replicas_needed = rep_delta.max(mis_delta);
        if replicas_needed == 0 {
            debug!(container=%container.id, "pending work already covers the shortfall");
            return;
        }

        let mut exclude: Vec<DatanodeDetails> =
            replicas.iter().map(|r| r.datanode.clone()).collect();
        exclude.extend(replication_targets.iter().cloned());
        let targets = match self
            .placement
            .choose(&exclude, replicas_needed, container.used_bytes)
        {
            Ok(targets) => targets,
            Err(e) => {
                warn!(container=%container.id, %e, "placement policy found no replication targets");
                return;
            }
        };

        let improves = if rep_delta > 0 {
            true
        } else {
            let mut proposed = placed;
            proposed.extend(targets.iter().cloned());
            self.placement
                .validate(&proposed, container.replication_factor)
                .mis_replication_count()
                < mis_delta
        };
        if !improves {
            info!(
                container=%container.id,
                "chosen targets would not improve placement, skipping replication"
            );
            return;
        }

        for target in &targets {
            self.send_replicate_command(container, target, sources.clone());
        }
    }

    fn handle_over_replicated(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
        count: &ReplicaCount,
    ) {
        let mut excess = (-count.additional_replica_needed()).max(0) as usize;
        if excess == 0 {
            return;
        }

        // Every SCM replica must trim identically: candidates are ordered by
        // the stable key (container id, datanode uuid).
        let mut candidates: Vec<ContainerReplica> = replicas.to_vec();
        candidates.sort_by_key(|r| (container.id, r.datanode.id));

        // While the container is not yet CLOSED, one matching replica per
        // origin is kept as a potential force-close participant.
        let eligible: Vec<ContainerReplica> = if container.state != LifeCycleState::Closed {
            let mut protected_origins = HashSet::new();
            candidates
                .into_iter()
                .filter(|r| {
                    !(r.state.matches(container.state)
                        && protected_origins.insert(r.origin_datanode_id))
                })
                .collect()
        } else {
            candidates
        };

        let eligible: Vec<ContainerReplica> = eligible
            .into_iter()
            .filter(|r| {
                self.nodes
                    .node_status(&r.datanode)
                    .map(|status| status.is_in_service())
                    .unwrap_or(false)
            })
            .collect();

        let mut working: Vec<DatanodeDetails> =
            replicas.iter().map(|r| r.datanode.clone()).collect();
        let (unhealthy, healthy): (Vec<ContainerReplica>, Vec<ContainerReplica>) = eligible
            .into_iter()
            .partition(|r| !r.state.matches(container.state));

        // Mismatched replicas go first and skip the placement check; a
        // transiently bad-looking placement self-corrects on the next cycle.
        for replica in unhealthy {
            if excess == 0 {
                break;
            }
            self.send_delete_command(container, &replica.datanode, true);
            working.retain(|d| *d != replica.datanode);
            excess -= 1;
        }

        for replica in healthy {
            if excess == 0 {
                break;
            }
            let current = self
                .placement
                .validate(&working, container.replication_factor);
            let without: Vec<DatanodeDetails> = working
                .iter()
                .filter(|d| **d != replica.datanode)
                .cloned()
                .collect();
            let after = self
                .placement
                .validate(&without, container.replication_factor);
            if current.actually_equal(&after) {
                self.send_delete_command(container, &replica.datanode, true);
                working = without;
                excess -= 1;
            }
        }
    }

    /// One-shot cleanup of replicas disagreeing with the container state.
    /// Closable replicas get closed; of the rest, exactly one is deleted per
    /// cycle so the container goes briefly under-replicated and the next
    /// cycle re-replicates a healthy copy.
    fn handle_unstable(&self, container: &ContainerInfo, replicas: &[ContainerReplica]) {
        let mut unhealthy: Vec<&ContainerReplica> = replicas
            .iter()
            .filter(|r| !r.state.matches(container.state))
            .collect();

        unhealthy.retain(|replica| match replica.state {
            ReplicaState::Open | ReplicaState::Closing => {
                self.send_close_command(container, &replica.datanode, false);
                false
            }
            ReplicaState::QuasiClosed if replica.sequence_id == container.sequence_id => {
                self.send_close_command(container, &replica.datanode, true);
                false
            }
            _ => true,
        });

        if let Some(replica) = unhealthy.first() {
            self.send_delete_command(container, &replica.datanode, true);
        }
    }
}

/// Runs the replication monitor until `shutdown` fires, processing every
/// container once per configured interval.
///
/// The monitor sleeps before its first pass: a freshly elected leader is
/// still collecting replica reports and acting early would schedule spurious
/// repairs.
pub async fn run_replication_monitor(manager: Arc<ReplicationManager>, shutdown: CancellationToken) {
    let interval = manager.config.interval();
    loop {
        tokio::select!(
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown.cancelled() => {},
        );
        if shutdown.is_cancelled() {
            info!("replication monitor shutdown");
            return;
        }
        if manager.should_run() {
            manager.process_all().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mock::{
        container, datanode, empty_container, replica, InMemoryMoveTable, LocalConsensus,
        MockContainerManager, MockNodeManager, MockPlacementPolicy, MockScmContext,
        RecordingEventPublisher,
    };
    use crate::move_scheduler::ReplicatedMoveScheduler;
    use data_types::{NodeHealth, NodeOperationalState};
    use scm_time::MockProvider;
    use std::time::Duration;

    pub(crate) struct TestFixture {
        pub manager: Arc<ReplicationManager>,
        pub containers: Arc<MockContainerManager>,
        pub nodes: Arc<MockNodeManager>,
        pub placement: Arc<MockPlacementPolicy>,
        pub publisher: Arc<RecordingEventPublisher>,
        pub context: Arc<MockScmContext>,
        pub consensus: Arc<LocalConsensus>,
        pub move_table: Arc<InMemoryMoveTable>,
        pub time_provider: Arc<MockProvider>,
    }

    impl TestFixture {
        pub fn new() -> Self {
            test_helpers::maybe_start_logging();
            Self::with_config(ReplicationConfig::new(
                Duration::from_secs(300),
                Duration::from_secs(30 * 60),
                2,
                Duration::ZERO,
            ))
        }

        pub fn with_config(config: ReplicationConfig) -> Self {
            let containers = Arc::new(MockContainerManager::default());
            let nodes = Arc::new(MockNodeManager::default());
            let placement = Arc::new(MockPlacementPolicy::default());
            let publisher = Arc::new(RecordingEventPublisher::default());
            let context = Arc::new(MockScmContext::leader_ready());
            let consensus = Arc::new(LocalConsensus::default());
            let move_table = Arc::new(InMemoryMoveTable::default());
            let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
            let registry = metric::Registry::new();

            let manager = Arc::new(ReplicationManager::new(
                config,
                Arc::clone(&containers) as _,
                Arc::clone(&nodes) as _,
                Arc::clone(&placement) as _,
                Arc::clone(&publisher) as _,
                Arc::clone(&context) as _,
                Arc::new(ReplicatedMoveScheduler::new(
                    Arc::clone(&consensus) as _,
                    Arc::clone(&move_table) as _,
                )) as _,
                &registry,
                Arc::clone(&time_provider) as _,
            ));

            Self {
                manager,
                containers,
                nodes,
                placement,
                publisher,
                context,
                consensus,
                move_table,
                time_provider,
            }
        }

        /// Register a healthy in-service datanode.
        pub fn healthy_node(&self, name: &str) -> DatanodeDetails {
            let dn = datanode(name);
            self.nodes.register(&dn, NodeStatus::healthy_in_service());
            dn
        }

        /// Add a replica of `container` with the given state on `dn`.
        pub fn add_replica(
            &self,
            container: &ContainerInfo,
            dn: &DatanodeDetails,
            state: ReplicaState,
        ) -> ContainerReplica {
            let r = replica(container, dn, state);
            self.containers.add_replica(r.clone());
            r
        }

        pub fn delete_commands(&self) -> Vec<crate::command::CommandEnvelope> {
            self.publisher
                .commands()
                .into_iter()
                .filter(|c| matches!(c.command, DatanodeCommand::DeleteContainer { .. }))
                .collect()
        }

        pub fn replicate_commands(&self) -> Vec<crate::command::CommandEnvelope> {
            self.publisher
                .commands()
                .into_iter()
                .filter(|c| matches!(c.command, DatanodeCommand::ReplicateContainer { .. }))
                .collect()
        }

        pub fn close_commands(&self) -> Vec<crate::command::CommandEnvelope> {
            self.publisher
                .commands()
                .into_iter()
                .filter(|c| matches!(c.command, DatanodeCommand::CloseContainer { .. }))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_open_container_with_open_replicas_untouched() {
        let fixture = TestFixture::new();
        let c = container(1, LifeCycleState::Open, 3);
        fixture.containers.add_container(c.clone());
        for name in ["a", "b", "c"] {
            let dn = fixture.healthy_node(name);
            fixture.add_replica(&c, &dn, ReplicaState::Open);
        }

        fixture.manager.process_container(&c).await.unwrap();
        assert!(fixture.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_open_container_with_closing_replica_requests_close() {
        let fixture = TestFixture::new();
        let c = container(1, LifeCycleState::Open, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        fixture.add_replica(&c, &a, ReplicaState::Open);
        fixture.add_replica(&c, &b, ReplicaState::Closing);

        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(
            fixture.publisher.events(),
            vec![crate::interface::Event::CloseContainer(c.id)]
        );
    }

    #[tokio::test]
    async fn test_closing_container_sends_close_to_every_replica() {
        let fixture = TestFixture::new();
        let c = container(7, LifeCycleState::Closing, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        fixture.add_replica(&c, &a, ReplicaState::Open);
        fixture.add_replica(&c, &b, ReplicaState::Open);

        fixture.manager.process_container(&c).await.unwrap();

        let commands = fixture.close_commands();
        assert_eq!(commands.len(), 2);
        let targets: HashSet<_> = commands.iter().map(|c| c.target.id).collect();
        assert_eq!(targets, HashSet::from([a.id, b.id]));
        for command in commands {
            assert!(matches!(
                command.command,
                DatanodeCommand::CloseContainer { force: false, .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_quasi_closed_majority_force_closes_highest_sequence() {
        let fixture = TestFixture::new();
        let mut c = container(11, LifeCycleState::QuasiClosed, 3);
        c.sequence_id = SequenceNumber::new(7);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        let d = fixture.healthy_node("d");
        let mut ra = fixture.add_replica(&c, &a, ReplicaState::QuasiClosed);
        ra.sequence_id = SequenceNumber::new(5);
        fixture.containers.add_replica(ra);
        let mut rb = fixture.add_replica(&c, &b, ReplicaState::QuasiClosed);
        rb.sequence_id = SequenceNumber::new(7);
        fixture.containers.add_replica(rb);
        let mut rd = fixture.add_replica(&c, &d, ReplicaState::QuasiClosed);
        rd.sequence_id = SequenceNumber::new(7);
        fixture.containers.add_replica(rd);

        fixture.manager.process_container(&c).await.unwrap();

        let commands = fixture.close_commands();
        assert_eq!(commands.len(), 2);
        let targets: HashSet<_> = commands.iter().map(|c| c.target.id).collect();
        assert_eq!(targets, HashSet::from([b.id, d.id]));
        for command in commands {
            assert!(matches!(
                command.command,
                DatanodeCommand::CloseContainer { force: true, .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_quasi_closed_minority_does_not_force_close() {
        let fixture = TestFixture::new();
        let c = container(11, LifeCycleState::QuasiClosed, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        let d = fixture.healthy_node("d");

        // only one distinct origin among the quasi-closed replicas
        let origin = a.id;
        for dn in [&a, &b] {
            let mut r = replica(&c, dn, ReplicaState::QuasiClosed);
            r.origin_datanode_id = origin;
            fixture.containers.add_replica(r);
        }
        fixture.add_replica(&c, &d, ReplicaState::Closed);

        fixture.manager.process_container(&c).await.unwrap();
        assert!(fixture.close_commands().is_empty());
    }

    #[tokio::test]
    async fn test_under_replicated_dispatches_replicate() {
        let fixture = TestFixture::new();
        let c = container(20, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        let mut ra = replica(&c, &a, ReplicaState::Closed);
        ra.sequence_id = SequenceNumber::new(3);
        fixture.containers.add_replica(ra);
        let mut rb = replica(&c, &b, ReplicaState::Closed);
        rb.sequence_id = SequenceNumber::new(9);
        fixture.containers.add_replica(rb);

        let d = fixture.healthy_node("d");
        fixture.placement.add_target(d.clone());

        fixture.manager.process_container(&c).await.unwrap();

        let commands = fixture.replicate_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].target, d);
        // sources sorted by sequence id, freshest first
        assert_eq!(
            commands[0].command,
            DatanodeCommand::ReplicateContainer {
                container: c.id,
                sources: vec![b.clone(), a.clone()],
            }
        );
        let inflight = fixture.manager.inflight_replication();
        assert_eq!(inflight[&c.id].len(), 1);
        assert_eq!(inflight[&c.id][0].datanode, d);
    }

    #[tokio::test]
    async fn test_processing_twice_is_stable() {
        let fixture = TestFixture::new();
        let c = container(20, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        fixture.add_replica(&c, &a, ReplicaState::Closed);
        fixture.add_replica(&c, &b, ReplicaState::Closed);
        fixture.placement.add_target(fixture.healthy_node("d"));

        fixture.manager.process_all().await;
        assert_eq!(fixture.replicate_commands().len(), 1);

        // the pending add suppresses a second replicate
        fixture.manager.process_all().await;
        assert_eq!(fixture.replicate_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_under_replicated_without_source_warns_only() {
        let fixture = TestFixture::new();
        let c = container(21, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        fixture.add_replica(&c, &a, ReplicaState::Unhealthy);
        fixture.placement.add_target(fixture.healthy_node("d"));

        fixture.manager.process_container(&c).await.unwrap();
        assert!(fixture.replicate_commands().is_empty());
    }

    #[tokio::test]
    async fn test_stale_source_not_used() {
        let fixture = TestFixture::new();
        let c = container(22, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        fixture.add_replica(&c, &a, ReplicaState::Closed);

        let stale = datanode("stale");
        fixture.nodes.register(
            &stale,
            NodeStatus::new(NodeOperationalState::InService, NodeHealth::Stale),
        );
        fixture.add_replica(&c, &stale, ReplicaState::Closed);

        fixture.placement.add_target(fixture.healthy_node("d"));
        fixture.manager.process_container(&c).await.unwrap();

        let commands = fixture.replicate_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].command,
            DatanodeCommand::ReplicateContainer {
                container: c.id,
                sources: vec![a.clone()],
            }
        );
    }

    #[tokio::test]
    async fn test_over_replicated_deletes_exactly_one() {
        let fixture = TestFixture::new();
        let c = container(30, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        for name in ["a", "b", "d", "e"] {
            let dn = fixture.healthy_node(name);
            fixture.add_replica(&c, &dn, ReplicaState::Closed);
        }

        fixture.manager.process_container(&c).await.unwrap();

        let deletes = fixture.delete_commands();
        assert_eq!(deletes.len(), 1);
        assert!(matches!(
            deletes[0].command,
            DatanodeCommand::DeleteContainer { force: true, .. }
        ));

        // pending delete discounts the replica, second cycle is a no-op
        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(fixture.delete_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_over_replicated_trimming_is_deterministic() {
        let fixture = TestFixture::new();
        let c = container(30, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        let mut nodes: Vec<DatanodeDetails> = Vec::new();
        for name in ["a", "b", "d", "e"] {
            let dn = fixture.healthy_node(name);
            fixture.add_replica(&c, &dn, ReplicaState::Closed);
            nodes.push(dn);
        }
        nodes.sort();

        fixture.manager.process_container(&c).await.unwrap();

        // the lowest datanode uuid goes first
        let deletes = fixture.delete_commands();
        assert_eq!(deletes[0].target, nodes[0]);
    }

    #[tokio::test]
    async fn test_over_replicated_respects_placement() {
        let fixture = TestFixture::new();
        let c = container(31, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());

        // two replicas in rack one, one in rack two; deleting the rack-two
        // replica would collapse the spread
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        let d = fixture.healthy_node("d");
        let e = fixture.healthy_node("e");
        for dn in [&a, &b, &d, &e] {
            fixture.add_replica(&c, dn, ReplicaState::Closed);
        }
        fixture.placement.assign_rack(&a, "rack1");
        fixture.placement.assign_rack(&b, "rack1");
        fixture.placement.assign_rack(&d, "rack1");
        fixture.placement.assign_rack(&e, "rack2");

        fixture.manager.process_container(&c).await.unwrap();

        let deletes = fixture.delete_commands();
        assert_eq!(deletes.len(), 1);
        assert_ne!(deletes[0].target, e);
    }

    #[tokio::test]
    async fn test_over_replicated_unhealthy_trimmed_first() {
        let fixture = TestFixture::new();
        let c = container(32, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        for name in ["a", "b", "d"] {
            let dn = fixture.healthy_node(name);
            fixture.add_replica(&c, &dn, ReplicaState::Closed);
        }
        let sick = fixture.healthy_node("sick");
        fixture.add_replica(&c, &sick, ReplicaState::Unhealthy);

        // three matching copies plus a mismatched one: the container is not
        // over-replicated, it is unstable, and the mismatched replica goes
        fixture.manager.process_container(&c).await.unwrap();

        let deletes = fixture.delete_commands();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].target, sick);
    }

    #[tokio::test]
    async fn test_quasi_closed_over_replication_protects_origins() {
        let fixture = TestFixture::new();
        let c = container(33, LifeCycleState::QuasiClosed, 2);
        fixture.containers.add_container(c.clone());

        // three quasi-closed replicas of one origin: no force-close majority,
        // one replica protected per origin, one spare trimmed per cycle
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        let d = fixture.healthy_node("d");
        let origin = a.id;
        for dn in [&a, &b, &d] {
            let mut r = replica(&c, dn, ReplicaState::QuasiClosed);
            r.origin_datanode_id = origin;
            fixture.containers.add_replica(r);
        }

        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(fixture.delete_commands().len(), 1);

        // the pending delete discounts the spare; nothing more goes
        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(fixture.delete_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_factor_one_trimming_leaves_one_replica() {
        let fixture = TestFixture::new();
        let c = container(34, LifeCycleState::Closed, 1);
        fixture.containers.add_container(c.clone());
        for name in ["a", "b"] {
            let dn = fixture.healthy_node(name);
            fixture.add_replica(&c, &dn, ReplicaState::Closed);
        }

        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(fixture.delete_commands().len(), 1);

        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(fixture.delete_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_container_reclaimed() {
        let fixture = TestFixture::new();
        let c = empty_container(40, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        for dn in [&a, &b] {
            let mut r = replica(&c, dn, ReplicaState::Closed);
            r.bytes_used = 0;
            r.key_count = 0;
            fixture.containers.add_replica(r);
        }

        fixture.manager.process_container(&c).await.unwrap();

        let deletes = fixture.delete_commands();
        assert_eq!(deletes.len(), 2);
        for delete in deletes {
            assert!(matches!(
                delete.command,
                DatanodeCommand::DeleteContainer { force: false, .. }
            ));
        }
        assert_eq!(
            fixture.containers.container_state(c.id),
            Some(LifeCycleState::Deleting)
        );
    }

    #[tokio::test]
    async fn test_deleting_container_cleanup_when_no_replicas_left() {
        let fixture = TestFixture::new();
        let c = container(41, LifeCycleState::Deleting, 3);
        fixture.containers.add_container(c.clone());

        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(
            fixture.containers.container_state(c.id),
            Some(LifeCycleState::Deleted)
        );
    }

    #[tokio::test]
    async fn test_deleting_container_redispatch_suppressed_by_inflight() {
        let fixture = TestFixture::new();
        let c = container(42, LifeCycleState::Deleting, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        fixture.add_replica(&c, &a, ReplicaState::Closed);

        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(fixture.delete_commands().len(), 1);

        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(fixture.delete_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_unstable_container_closes_and_deletes_one() {
        let fixture = TestFixture::new();
        let mut c = container(50, LifeCycleState::Closed, 3);
        c.sequence_id = SequenceNumber::new(9);
        fixture.containers.add_container(c.clone());

        for name in ["a", "b", "d"] {
            let dn = fixture.healthy_node(name);
            fixture.add_replica(&c, &dn, ReplicaState::Closed);
        }
        let open = fixture.healthy_node("open");
        fixture.add_replica(&c, &open, ReplicaState::Open);
        let quasi_current = fixture.healthy_node("quasi-current");
        let mut qc = replica(&c, &quasi_current, ReplicaState::QuasiClosed);
        qc.sequence_id = SequenceNumber::new(9);
        fixture.containers.add_replica(qc);
        let sick_one = fixture.healthy_node("sick-one");
        fixture.add_replica(&c, &sick_one, ReplicaState::Unhealthy);
        let sick_two = fixture.healthy_node("sick-two");
        fixture.add_replica(&c, &sick_two, ReplicaState::Unhealthy);

        fixture.manager.process_container(&c).await.unwrap();

        // the open replica gets a plain close, the caught-up quasi-closed
        // replica a force close
        let closes = fixture.close_commands();
        assert_eq!(closes.len(), 2);
        let force_by_target: HashMap<_, _> = closes
            .iter()
            .map(|c| match &c.command {
                DatanodeCommand::CloseContainer { force, .. } => (c.target.id, *force),
                _ => unreachable!(),
            })
            .collect();
        assert!(!force_by_target[&open.id]);
        assert!(force_by_target[&quasi_current.id]);

        // exactly one of the unhealthy replicas is deleted this cycle
        let deletes = fixture.delete_commands();
        assert_eq!(deletes.len(), 1);
        assert!([sick_one.id, sick_two.id].contains(&deletes[0].target.id));
    }

    #[tokio::test]
    async fn test_maintenance_replicas_cover_shortfall() {
        let fixture = TestFixture::new();
        let c = container(60, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        fixture.add_replica(&c, &a, ReplicaState::Closed);
        fixture.add_replica(&c, &b, ReplicaState::Closed);

        let maintenance = datanode("m");
        fixture.nodes.register(
            &maintenance,
            NodeStatus::new(NodeOperationalState::InMaintenance, NodeHealth::Healthy),
        );
        fixture.add_replica(&c, &maintenance, ReplicaState::Closed);
        fixture.placement.add_target(fixture.healthy_node("d"));

        fixture.manager.process_container(&c).await.unwrap();
        assert!(fixture.replicate_commands().is_empty());
    }

    #[tokio::test]
    async fn test_leader_loss_skips_sends_and_bookkeeping() {
        let fixture = TestFixture::new();
        let c = container(70, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        fixture.add_replica(&c, &a, ReplicaState::Closed);
        fixture.placement.add_target(fixture.healthy_node("d"));
        fixture.placement.add_target(fixture.healthy_node("e"));

        fixture.context.set_leader(false);
        fixture.manager.process_container(&c).await.unwrap();

        assert!(fixture.publisher.events().is_empty());
        assert!(fixture.manager.inflight_replication().is_empty());
    }

    #[tokio::test]
    async fn test_inflight_replication_completion_counted() {
        let fixture = TestFixture::new();
        let c = container(80, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        fixture.add_replica(&c, &a, ReplicaState::Closed);
        fixture.add_replica(&c, &b, ReplicaState::Closed);
        let d = fixture.healthy_node("d");
        fixture.placement.add_target(d.clone());

        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(fixture.manager.inflight_replication().len(), 1);

        // the new replica lands; the next cycle retires the inflight entry
        fixture.add_replica(&c, &d, ReplicaState::Closed);
        fixture.manager.process_container(&c).await.unwrap();

        assert!(fixture.manager.inflight_replication().is_empty());
        assert_eq!(fixture.manager.metrics().replicate_completed.fetch(), 1);
        assert_eq!(
            fixture.manager.metrics().replicate_bytes_completed.fetch(),
            c.used_bytes
        );
    }

    #[tokio::test]
    async fn test_inflight_replication_timeout_counted() {
        let fixture = TestFixture::new();
        let c = container(81, LifeCycleState::Closed, 3);
        fixture.containers.add_container(c.clone());
        let a = fixture.healthy_node("a");
        let b = fixture.healthy_node("b");
        fixture.add_replica(&c, &a, ReplicaState::Closed);
        fixture.add_replica(&c, &b, ReplicaState::Closed);
        fixture.placement.add_target(fixture.healthy_node("d"));

        fixture.manager.process_container(&c).await.unwrap();
        assert_eq!(fixture.manager.inflight_replication().len(), 1);

        fixture
            .time_provider
            .inc(Duration::from_secs(30 * 60) + Duration::from_secs(1));
        fixture.manager.process_container(&c).await.unwrap();

        assert_eq!(fixture.manager.metrics().replicate_timeout.fetch(), 1);
        // the timed out entry is gone and the shortfall was re-dispatched
        assert_eq!(fixture.replicate_commands().len(), 2);
    }

    #[tokio::test]
    async fn test_process_all_swallows_missing_container() {
        let fixture = TestFixture::new();
        let gone = container(90, LifeCycleState::Closed, 3);
        let stays = container(91, LifeCycleState::Closed, 3);
        fixture.containers.add_container(gone.clone());
        fixture.containers.add_container(stays.clone());
        let a = fixture.healthy_node("a");
        for c in [&gone, &stays] {
            fixture.add_replica(c, &a, ReplicaState::Closed);
            for name in ["b", "d"] {
                let dn = fixture.healthy_node(name);
                fixture.add_replica(c, &dn, ReplicaState::Closed);
            }
        }

        fixture.containers.remove_container(gone.id);
        let err = fixture.manager.process_container(&gone).await.unwrap_err();
        assert!(matches!(err, ContainerError::ContainerNotFound { .. }));

        // must not abort the cycle either
        fixture.manager.process_all().await;
    }

    #[tokio::test]
    async fn test_should_run_gating() {
        let fixture = TestFixture::with_config(ReplicationConfig::new(
            Duration::from_secs(300),
            Duration::from_secs(30 * 60),
            2,
            Duration::from_secs(120),
        ));

        assert!(!fixture.manager.should_run());

        fixture.manager.notify_status_changed().await;
        // within the grace period
        assert!(!fixture.manager.should_run());

        fixture.time_provider.inc(Duration::from_secs(120));
        assert!(fixture.manager.should_run());

        // losing readiness pauses the manager again
        fixture.context.set_leader_ready(false);
        fixture.manager.notify_status_changed().await;
        assert!(!fixture.manager.should_run());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let fixture = TestFixture::new();
        assert!(!fixture.manager.is_running());

        fixture.manager.start();
        assert!(fixture.manager.is_running());

        // some stale bookkeeping to be dropped on stop
        fixture.manager.inflight_replication.record(
            ContainerId::new(1),
            InflightAction {
                datanode: datanode("a"),
                issued_at: Time::from_timestamp_millis(0),
            },
        );

        fixture.manager.stop();
        assert!(!fixture.manager.is_running());
        assert!(fixture.manager.inflight_replication().is_empty());
        assert!(fixture.manager.inflight_deletion().is_empty());
    }
}
