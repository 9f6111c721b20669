//! Tracking of issued replicate and delete commands awaiting their effect.
//!
//! Commands are never acknowledged directly; an entry is considered done
//! when the expected change shows up in (or disappears from) the replica
//! reports, and abandoned when its datanode times out, goes unhealthy, or
//! leaves service.

use data_types::{ContainerId, DatanodeDetails, NodeStatus};
use parking_lot::Mutex;
use scm_time::Time;
use std::collections::HashMap;
use std::time::Duration;

/// One issued command: the datanode it was addressed to and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightAction {
    /// The command's target datanode.
    pub datanode: DatanodeDetails,
    /// When the command was handed to the event bus.
    pub issued_at: Time,
}

/// Why an [`InflightAction`] was dropped during reconciliation.
///
/// More than one condition can hold at once; consumers pick by their own
/// precedence.
#[derive(Debug, Clone)]
pub struct InflightRemoval {
    /// The dropped action.
    pub action: InflightAction,
    /// The expected replica change was observed.
    pub completed: bool,
    /// The action outlived the event timeout.
    pub timed_out: bool,
    /// The target datanode is no longer healthy.
    pub unhealthy: bool,
    /// The target datanode left IN_SERVICE.
    pub not_in_service: bool,
    /// False when the node manager no longer knows the datanode at all.
    pub node_known: bool,
}

/// Pending actions of one kind (replication or deletion), keyed by container.
///
/// A `(container, datanode)` pair is tracked at most once. Containers with
/// no remaining actions are garbage collected on reconciliation.
#[derive(Debug, Default)]
pub struct InflightMap {
    actions: Mutex<HashMap<ContainerId, Vec<InflightAction>>>,
}

impl InflightMap {
    /// Track a newly issued command. A second command for the same
    /// `(container, datanode)` pair is ignored.
    pub fn record(&self, container: ContainerId, action: InflightAction) {
        let mut actions = self.actions.lock();
        let entries = actions.entry(container).or_default();
        if !entries.iter().any(|a| a.datanode == action.datanode) {
            entries.push(action);
        }
    }

    /// Whether any action is pending for the container.
    pub fn contains(&self, container: ContainerId) -> bool {
        self.actions.lock().contains_key(&container)
    }

    /// Whether an action addressed to `datanode` is pending for the
    /// container.
    pub fn contains_datanode(&self, container: ContainerId, datanode: &DatanodeDetails) -> bool {
        self.actions
            .lock()
            .get(&container)
            .map(|entries| entries.iter().any(|a| a.datanode == *datanode))
            .unwrap_or(false)
    }

    /// The datanodes with pending actions for the container.
    pub fn datanodes(&self, container: ContainerId) -> Vec<DatanodeDetails> {
        self.actions
            .lock()
            .get(&container)
            .map(|entries| entries.iter().map(|a| a.datanode.clone()).collect())
            .unwrap_or_default()
    }

    /// The number of pending actions for the container.
    pub fn len_for(&self, container: ContainerId) -> usize {
        self.actions
            .lock()
            .get(&container)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Total pending actions across all containers.
    pub fn total_len(&self) -> usize {
        self.actions.lock().values().map(Vec::len).sum()
    }

    /// A copy of the full map, for introspection.
    pub fn snapshot(&self) -> HashMap<ContainerId, Vec<InflightAction>> {
        self.actions.lock().clone()
    }

    /// Drop every pending action.
    pub fn clear(&self) {
        self.actions.lock().clear()
    }

    /// Drop every action for `container` that has completed, timed out, or
    /// whose datanode is unusable, returning what was dropped and why.
    ///
    /// `completed` decides whether the expected replica change was observed;
    /// `node_status` resolves the current status of a datanode, `None` when
    /// the node manager no longer knows it.
    pub fn reconcile(
        &self,
        container: ContainerId,
        now: Time,
        timeout: Duration,
        completed: impl Fn(&InflightAction) -> bool,
        node_status: impl Fn(&DatanodeDetails) -> Option<NodeStatus>,
    ) -> Vec<InflightRemoval> {
        let mut actions = self.actions.lock();
        let Some(entries) = actions.get_mut(&container) else {
            return vec![];
        };

        let mut removals = vec![];
        entries.retain(|action| {
            let Some(status) = node_status(&action.datanode) else {
                removals.push(InflightRemoval {
                    action: action.clone(),
                    completed: false,
                    timed_out: false,
                    unhealthy: false,
                    not_in_service: false,
                    node_known: false,
                });
                return false;
            };

            let completed = completed(action);
            let timed_out = now
                .checked_duration_since(action.issued_at)
                .map(|age| age > timeout)
                .unwrap_or(false);
            let unhealthy = !status.is_healthy();
            let not_in_service = !status.is_in_service();

            if completed || timed_out || unhealthy || not_in_service {
                removals.push(InflightRemoval {
                    action: action.clone(),
                    completed,
                    timed_out,
                    unhealthy,
                    not_in_service,
                    node_known: true,
                });
                false
            } else {
                true
            }
        });

        if entries.is_empty() {
            actions.remove(&container);
        }
        removals
    }
}
