//! Classification of a container's replica set against its replication
//! factor.

use data_types::{ContainerInfo, ContainerReplica, LifeCycleState, NodeStatus};

/// A point-in-time count of a container's replicas, classified by the state
/// of the replica and the node hosting it.
///
/// Only replicas whose state matches the container state count toward
/// sufficiency. Replicas on decommissioning or decommissioned nodes never
/// count; replicas on maintenance nodes count only while enough healthy
/// copies remain outside maintenance.
#[derive(Debug, Clone)]
pub struct ReplicaCount {
    container_state: LifeCycleState,
    replication_factor: usize,
    min_healthy_for_maintenance: usize,
    /// Matching replicas on in-service nodes.
    healthy: usize,
    /// Matching replicas on (entering-)maintenance nodes.
    maintenance: usize,
    /// Replicas on (de)commissioning nodes, matching or not.
    decommission: usize,
    /// State-mismatched replicas on in-service nodes.
    mismatched: usize,
    inflight_add: usize,
    inflight_del: usize,
}

impl ReplicaCount {
    /// Classify `replicas` (paired with the status of their hosting node)
    /// against the container's requirements.
    pub fn new(
        container: &ContainerInfo,
        replicas: &[(ContainerReplica, NodeStatus)],
        inflight_add: usize,
        inflight_del: usize,
        min_healthy_for_maintenance: usize,
    ) -> Self {
        let mut healthy = 0;
        let mut maintenance = 0;
        let mut decommission = 0;
        let mut mismatched = 0;

        for (replica, status) in replicas {
            if status.is_decommission() {
                decommission += 1;
            } else if !replica.state.matches(container.state) {
                if status.is_in_service() {
                    mismatched += 1;
                }
            } else if status.is_in_maintenance() {
                maintenance += 1;
            } else {
                healthy += 1;
            }
        }

        Self {
            container_state: container.state,
            replication_factor: container.replication_factor,
            min_healthy_for_maintenance,
            healthy,
            maintenance,
            decommission,
            mismatched,
            inflight_add,
            inflight_del,
        }
    }

    /// Matching replicas on in-service nodes.
    pub fn healthy_count(&self) -> usize {
        self.healthy
    }

    /// Matching replicas on maintenance nodes.
    pub fn maintenance_count(&self) -> usize {
        self.maintenance
    }

    /// Replicas on decommissioning or decommissioned nodes.
    pub fn decommission_count(&self) -> usize {
        self.decommission
    }

    /// Replicas the manager can already count on: matching in-service copies
    /// plus pending adds, minus pending deletes.
    fn available(&self) -> i64 {
        self.healthy as i64 + self.inflight_add as i64 - self.inflight_del as i64
    }

    /// The signed repair delta.
    ///
    /// Positive: the container is under-replicated by that many copies.
    /// Negative: over-replicated by the magnitude. Zero: exactly right.
    pub fn additional_replica_needed(&self) -> i64 {
        let delta = self.replication_factor as i64 - self.available();
        if delta <= 0 {
            return delta;
        }

        // Replicas on maintenance nodes cover the shortfall as long as the
        // configured number of healthy copies remains outside maintenance.
        let beyond_maintenance = (delta - self.maintenance as i64).max(0);
        let needed_healthy =
            self.replication_factor.min(self.min_healthy_for_maintenance) as i64;
        let maintenance_floor = if self.maintenance > 0 {
            (needed_healthy - self.available()).max(0)
        } else {
            0
        };
        beyond_maintenance.max(maintenance_floor)
    }

    /// No additional replica is needed.
    pub fn is_sufficiently_replicated(&self) -> bool {
        self.additional_replica_needed() <= 0
    }

    /// There are more usable replicas than the replication factor asks for.
    pub fn is_over_replicated(&self) -> bool {
        self.additional_replica_needed() < 0
    }

    /// The container is settled and every in-service replica agrees with its
    /// state.
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.container_state,
            LifeCycleState::Closed | LifeCycleState::QuasiClosed
        ) && self.mismatched == 0
    }
}

/// Whether a container holds no data at all and can be reclaimed: it is
/// CLOSED with zero bytes and keys, and every replica reports the same.
pub fn is_container_empty(container: &ContainerInfo, replicas: &[ContainerReplica]) -> bool {
    container.state == LifeCycleState::Closed
        && container.used_bytes == 0
        && container.key_count == 0
        && replicas.iter().all(|r| {
            r.state == data_types::ReplicaState::Closed && r.bytes_used == 0 && r.key_count == 0
        })
}
