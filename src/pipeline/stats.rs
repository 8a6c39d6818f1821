use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Pipeline counters, updated lock-free from every task
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    duplicates: AtomicU64,
    unparsed: AtomicU64,
    alerts_emitted: AtomicU64,
    enrichment_failures: AtomicU64,
    short_circuits: AtomicU64,
    queue_overflows: AtomicU64,
    undeliverable: AtomicU64,
    partial_deliveries: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub duplicates: u64,
    pub unparsed: u64,
    pub alerts_emitted: u64,
    pub enrichment_failures: u64,
    pub short_circuits: u64,
    pub queue_overflows: u64,
    pub undeliverable: u64,
    pub partial_deliveries: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self) {
        bump(&self.processed);
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicates);
    }

    pub fn record_unparsed(&self) {
        bump(&self.unparsed);
    }

    pub fn record_alert(&self) {
        bump(&self.alerts_emitted);
    }

    pub fn record_enrichment_failure(&self) {
        bump(&self.enrichment_failures);
    }

    pub fn record_short_circuit(&self) {
        bump(&self.short_circuits);
    }

    pub fn record_overflow(&self) {
        bump(&self.queue_overflows);
    }

    pub fn record_undeliverable(&self) {
        bump(&self.undeliverable);
    }

    /// Retries ran out after some sinks had already accepted the alert
    pub fn record_partial_delivery(&self) {
        bump(&self.partial_deliveries);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unparsed: self.unparsed.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            enrichment_failures: self.enrichment_failures.load(Ordering::Relaxed),
            short_circuits: self.short_circuits.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            undeliverable: self.undeliverable.load(Ordering::Relaxed),
            partial_deliveries: self.partial_deliveries.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={} duplicates={} unparsed={} alerts={} enrichment_failures={} short_circuits={} overflows={} undeliverable={} partial={}",
            self.processed,
            self.duplicates,
            self.unparsed,
            self.alerts_emitted,
            self.enrichment_failures,
            self.short_circuits,
            self.queue_overflows,
            self.undeliverable,
            self.partial_deliveries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = PipelineStats::new();
        stats.record_processed();
        stats.record_processed();
        stats.record_alert();
        stats.record_overflow();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.alerts_emitted, 1);
        assert_eq!(snapshot.queue_overflows, 1);
        assert_eq!(snapshot.duplicates, 0);
        assert!(snapshot.to_string().contains("processed=2"));
    }
}
