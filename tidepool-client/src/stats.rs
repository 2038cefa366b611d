//! Per-operation latency statistics.
//!
//! In-process sinks only: counters plus accumulated latency per op stream,
//! cheap enough to record unconditionally. Callers that do not care simply
//! never look at the snapshots.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// A single op-stream accumulator (e.g. "adds on channel store-1:3181").
#[derive(Clone, Default)]
pub struct OpStats {
    inner: Rc<RefCell<OpStatsInner>>,
}

#[derive(Default)]
struct OpStatsInner {
    successes: u64,
    failures: u64,
    success_latency: Duration,
    failure_latency: Duration,
}

/// Point-in-time copy of an [`OpStats`] stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpStatsSnapshot {
    /// Number of successful events recorded.
    pub successes: u64,
    /// Number of failed events recorded.
    pub failures: u64,
    /// Accumulated latency of successful events.
    pub success_latency: Duration,
    /// Accumulated latency of failed events.
    pub failure_latency: Duration,
}

impl OpStats {
    /// Record a successful event with its latency.
    pub fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.borrow_mut();
        inner.successes += 1;
        inner.success_latency += latency;
    }

    /// Record a failed event with its latency.
    pub fn record_failure(&self, latency: Duration) {
        let mut inner = self.inner.borrow_mut();
        inner.failures += 1;
        inner.failure_latency += latency;
    }

    /// Take a snapshot of the current counters.
    pub fn snapshot(&self) -> OpStatsSnapshot {
        let inner = self.inner.borrow();
        OpStatsSnapshot {
            successes: inner.successes,
            failures: inner.failures,
            success_latency: inner.success_latency,
            failure_latency: inner.failure_latency,
        }
    }
}

/// Statistic streams scoped to one server channel.
#[derive(Clone, Default)]
pub struct ChannelStats {
    /// Add operations, recorded when the completion resolves.
    pub add_op: OpStats,
    /// Read operations, recorded when the completion resolves.
    pub read_op: OpStats,
    /// Add operations expired by the timeout scan.
    pub add_timeout: OpStats,
    /// Read operations expired by the timeout scan.
    pub read_timeout: OpStats,
}
