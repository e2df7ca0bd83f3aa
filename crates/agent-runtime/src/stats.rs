//! Per-agent traffic counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, bumped by the receive loop and handler tasks
#[derive(Debug, Default)]
pub struct AgentStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    responses_matched: AtomicU64,
    late_responses: AtomicU64,
    dead_letters: AtomicU64,
    handler_failures: AtomicU64,
    requests_timed_out: AtomicU64,
}

/// Point-in-time copy of [`AgentStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub responses_matched: u64,
    pub late_responses: u64,
    pub dead_letters: u64,
    pub handler_failures: u64,
    pub requests_timed_out: u64,
}

impl AgentStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_matched(&self) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_late_response(&self) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = AgentStats::default();
        stats.record_received();
        stats.record_received();
        stats.record_dead_letter();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.dead_letters, 1);
        assert_eq!(snapshot.dispatched, 0);
    }
}
