//! Metrics published by the replication manager.

use crate::moves::MoveResult;
use metric::{Metric, U64Counter, U64Gauge};

/// Counters and gauges tracking the replication manager's activity.
#[derive(Debug)]
pub struct ReplicationMetrics {
    /// Close commands handed to the event bus.
    pub close_sent: U64Counter,
    /// Replicate commands handed to the event bus.
    pub replicate_sent: U64Counter,
    /// Delete commands handed to the event bus.
    pub delete_sent: U64Counter,

    /// Replications confirmed through replica reports.
    pub replicate_completed: U64Counter,
    /// Replications dropped after the event timeout.
    pub replicate_timeout: U64Counter,
    /// Bytes of confirmed replications.
    pub replicate_bytes_completed: U64Counter,

    /// Deletions confirmed through replica reports.
    pub delete_completed: U64Counter,
    /// Deletions dropped after the event timeout.
    pub delete_timeout: U64Counter,
    /// Bytes of confirmed deletions.
    pub delete_bytes_completed: U64Counter,

    /// Pending replicate commands.
    pub inflight_replication: U64Gauge,
    /// Pending delete commands.
    pub inflight_deletion: U64Gauge,

    move_results: Metric<U64Counter>,
}

impl ReplicationMetrics {
    /// Register the replication manager's instruments in `registry`.
    pub fn new(registry: &metric::Registry) -> Self {
        let commands: Metric<U64Counter> = registry.register_metric(
            "replication_manager_command_count",
            "commands issued by the replication manager, by command and outcome",
        );
        let bytes: Metric<U64Counter> = registry.register_metric(
            "replication_manager_bytes_count",
            "bytes of confirmed replication manager commands",
        );
        let inflight: Metric<U64Gauge> = registry.register_metric(
            "replication_manager_inflight_actions",
            "commands issued by the replication manager still awaiting their effect",
        );
        let move_results: Metric<U64Counter> = registry.register_metric(
            "replication_manager_move_result_count",
            "finished container moves, by outcome",
        );

        Self {
            close_sent: commands.recorder(&[("command", "close"), ("outcome", "sent")]),
            replicate_sent: commands.recorder(&[("command", "replicate"), ("outcome", "sent")]),
            delete_sent: commands.recorder(&[("command", "delete"), ("outcome", "sent")]),
            replicate_completed: commands
                .recorder(&[("command", "replicate"), ("outcome", "completed")]),
            replicate_timeout: commands
                .recorder(&[("command", "replicate"), ("outcome", "timeout")]),
            replicate_bytes_completed: bytes.recorder(&[("command", "replicate")]),
            delete_completed: commands.recorder(&[("command", "delete"), ("outcome", "completed")]),
            delete_timeout: commands.recorder(&[("command", "delete"), ("outcome", "timeout")]),
            delete_bytes_completed: bytes.recorder(&[("command", "delete")]),
            inflight_replication: inflight.recorder(&[("kind", "replication")]),
            inflight_deletion: inflight.recorder(&[("kind", "deletion")]),
            move_results,
        }
    }

    /// Count a finished move by its outcome.
    pub fn record_move_result(&self, result: MoveResult) {
        self.move_results
            .recorder(&[("result", result.as_str())])
            .inc(1);
    }

    /// The number of finished moves with the given outcome.
    pub fn move_result_count(&self, result: MoveResult) -> u64 {
        self.move_results
            .get_observer(&metric::Attributes::from(&[("result", result.as_str())]))
            .map(|observer| observer.fetch())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_result_counting() {
        let registry = metric::Registry::new();
        let metrics = ReplicationMetrics::new(&registry);

        assert_eq!(metrics.move_result_count(MoveResult::Completed), 0);
        metrics.record_move_result(MoveResult::Completed);
        metrics.record_move_result(MoveResult::Completed);
        metrics.record_move_result(MoveResult::DeleteFailPolicy);

        assert_eq!(metrics.move_result_count(MoveResult::Completed), 2);
        assert_eq!(metrics.move_result_count(MoveResult::DeleteFailPolicy), 1);
        assert_eq!(metrics.move_result_count(MoveResult::FailNotLeader), 0);
    }
}
