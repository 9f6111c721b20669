//! Configuration for the replication manager.

use std::time::Duration;

/// The configuration options for the replication manager.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationConfig {
    /// How often the replication monitor wakes up and processes every
    /// container.
    interval: Duration,

    /// How long an issued replicate or delete command may stay unacknowledged
    /// before the corresponding inflight entry is dropped and the work is
    /// rescheduled on a later cycle.
    event_timeout: Duration,

    /// The number of healthy replicas that must remain outside maintenance
    /// before replicas on maintenance nodes count toward sufficiency.
    maintenance_replica_minimum: usize,

    /// Grace period after leaving safe mode before the monitor starts acting.
    /// Replica reports trickle in after a restart; acting on a half-empty
    /// picture would schedule spurious re-replication.
    safe_mode_exit_grace: Duration,
}

impl ReplicationConfig {
    /// Initialize a new `ReplicationConfig`. Panics if `interval` or
    /// `event_timeout` is zero.
    pub fn new(
        interval: Duration,
        event_timeout: Duration,
        maintenance_replica_minimum: usize,
        safe_mode_exit_grace: Duration,
    ) -> Self {
        assert!(!interval.is_zero());
        assert!(!event_timeout.is_zero());

        Self {
            interval,
            event_timeout,
            maintenance_replica_minimum,
            safe_mode_exit_grace,
        }
    }

    /// Monitor cycle period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Inflight-action deadline.
    pub fn event_timeout(&self) -> Duration {
        self.event_timeout
    }

    /// Minimum healthy replicas required outside maintenance.
    pub fn maintenance_replica_minimum(&self) -> usize {
        self.maintenance_replica_minimum
    }

    /// Post-safe-mode grace before the monitor starts acting.
    pub fn safe_mode_exit_grace(&self) -> Duration {
        self.safe_mode_exit_grace
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            event_timeout: Duration::from_secs(30 * 60),
            maintenance_replica_minimum: 2,
            safe_mode_exit_grace: Duration::from_secs(300),
        }
    }
}
