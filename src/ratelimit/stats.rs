//! Decision counters for observability.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::decision::{Decision, RejectReason};

/// Counters of limiter activity.
///
/// Cloning shares the underlying counters.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    admitted: AtomicU64,
    rejected_over_limit: AtomicU64,
    rejected_cooldown: AtomicU64,
    rejected_out_of_order: AtomicU64,
    clients_evicted: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, decision: &Decision) {
        let counter = match decision {
            Decision::Allowed { .. } => &self.inner.admitted,
            Decision::Rejected(rejection) => match rejection.reason {
                RejectReason::OverLimit { .. } => &self.inner.rejected_over_limit,
                RejectReason::Cooldown { .. } => &self.inner.rejected_cooldown,
                RejectReason::OutOfOrder { .. } => &self.inner.rejected_out_of_order,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        self.inner
            .clients_evicted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn admitted(&self) -> u64 {
        self.inner.admitted.load(Ordering::Relaxed)
    }

    /// Total rejections of any kind.
    pub fn rejected(&self) -> u64 {
        self.inner.rejected_over_limit.load(Ordering::Relaxed)
            + self.inner.rejected_cooldown.load(Ordering::Relaxed)
            + self.inner.rejected_out_of_order.load(Ordering::Relaxed)
    }

    pub fn clients_evicted(&self) -> u64 {
        self.inner.clients_evicted.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.admitted(),
            rejected_over_limit: self.inner.rejected_over_limit.load(Ordering::Relaxed),
            rejected_cooldown: self.inner.rejected_cooldown.load(Ordering::Relaxed),
            rejected_out_of_order: self.inner.rejected_out_of_order.load(Ordering::Relaxed),
            clients_evicted: self.clients_evicted(),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.inner.admitted.store(0, Ordering::Relaxed);
        self.inner.rejected_over_limit.store(0, Ordering::Relaxed);
        self.inner.rejected_cooldown.store(0, Ordering::Relaxed);
        self.inner.rejected_out_of_order.store(0, Ordering::Relaxed);
        self.inner.clients_evicted.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub rejected_over_limit: u64,
    pub rejected_cooldown: u64,
    pub rejected_out_of_order: u64,
    pub clients_evicted: u64,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.admitted + self.rejected_over_limit + self.rejected_cooldown + self.rejected_out_of_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::decision::Rejection;

    fn rejected(reason: RejectReason) -> Decision {
        Decision::Rejected(Rejection {
            rule_index: None,
            window: None,
            reason,
            retry_at: 0,
        })
    }

    #[test]
    fn test_record_by_reason() {
        let stats = Stats::new();
        stats.record(&Decision::Allowed { remaining: 1 });
        stats.record(&Decision::Allowed { remaining: 0 });
        stats.record(&rejected(RejectReason::OverLimit {
            cooldown_until: Some(4),
        }));
        stats.record(&rejected(RejectReason::Cooldown { until: 4 }));
        stats.record(&rejected(RejectReason::OutOfOrder { last_admitted: 9 }));
        stats.record_evictions(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.admitted, 2);
        assert_eq!(snapshot.rejected_over_limit, 1);
        assert_eq!(snapshot.rejected_cooldown, 1);
        assert_eq!(snapshot.rejected_out_of_order, 1);
        assert_eq!(snapshot.clients_evicted, 2);
        assert_eq!(snapshot.total(), 5);
        assert_eq!(stats.rejected(), 3);
    }

    #[test]
    fn test_clones_share_counters() {
        let stats = Stats::new();
        let clone = stats.clone();
        clone.record(&Decision::Allowed { remaining: 0 });
        assert_eq!(stats.admitted(), 1);

        stats.reset();
        assert_eq!(clone.snapshot(), StatsSnapshot::default());
    }
}
