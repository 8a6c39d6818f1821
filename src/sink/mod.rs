//! Alert sinks
//!
//! A sink is where finished alerts go: a file, a database, a webhook. The
//! pipeline retries failed writes with backoff. Sinks with several targets
//! remember which targets already hold a retried alert and skip them.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::models::{Alert, LogEvent};
use crate::persistence::PersistenceError;

/// Errors raised while delivering to a sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Sink rejected the write: {0}")]
    Rejected(String),

    #[error("Delivered to {delivered} of {total} targets: {source}")]
    Partial {
        delivered: usize,
        total: usize,
        source: Box<SinkError>,
    },
}

impl SinkError {
    /// True when at least one target already holds the alert
    pub fn is_partial(&self) -> bool {
        matches!(self, SinkError::Partial { delivered, .. } if *delivered > 0)
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn put(&self, alert: &Alert) -> Result<(), SinkError>;

    /// Plain log path for events that raised no alert
    async fn forward_log(&self, _event: &LogEvent) -> Result<(), SinkError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// The caller stopped retrying this alert; drop any delivery state kept for it
    fn abandon(&self, _alert: &Alert) {}
}

/// Targets that already accepted an alert whose delivery is still being retried
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    pending: Mutex<HashMap<String, BTreeSet<usize>>>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indices of the targets holding `event_id` from earlier attempts
    pub fn delivered(&self, event_id: &str) -> BTreeSet<usize> {
        self.pending.lock().get(event_id).cloned().unwrap_or_default()
    }

    /// Remember a partial delivery so the next attempt only retries the rest
    pub fn retain(&self, event_id: &str, delivered: BTreeSet<usize>) {
        self.pending.lock().insert(event_id.to_string(), delivered);
    }

    pub fn forget(&self, event_id: &str) {
        self.pending.lock().remove(event_id);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Settle one attempt over `total` targets
    pub fn settle(
        &self,
        event_id: &str,
        delivered: BTreeSet<usize>,
        total: usize,
        error: Option<SinkError>,
    ) -> Result<(), SinkError> {
        match error {
            None => {
                self.forget(event_id);
                Ok(())
            }
            Some(source) => {
                let held = delivered.len();
                self.retain(event_id, delivered);
                Err(SinkError::Partial {
                    delivered: held,
                    total,
                    source: Box::new(source),
                })
            }
        }
    }
}

/// Delivers every write to each inner sink; fails if any of them fails.
///
/// A retried alert only goes to the sinks that have not accepted it yet.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AlertSink>>,
    ledger: DeliveryLedger,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        FanoutSink {
            sinks,
            ledger: DeliveryLedger::new(),
        }
    }

    /// Alerts still waiting on at least one inner sink
    pub fn pending(&self) -> usize {
        self.ledger.len()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AlertSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn put(&self, alert: &Alert) -> Result<(), SinkError> {
        let mut delivered = self.ledger.delivered(&alert.event_id);
        let mut first_error = None;
        for (index, sink) in self.sinks.iter().enumerate() {
            if delivered.contains(&index) {
                continue;
            }
            match sink.put(alert).await {
                Ok(()) => {
                    delivered.insert(index);
                }
                Err(e) => {
                    log::error!("Sink {} failed for alert {}: {}", sink.name(), alert.event_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.ledger
            .settle(&alert.event_id, delivered, self.sinks.len(), first_error)
    }

    async fn forward_log(&self, event: &LogEvent) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.forward_log(event).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn flush(&self) -> Result<(), SinkError> {
        for sink in &self.sinks {
            sink.flush().await?;
        }
        Ok(())
    }

    fn abandon(&self, alert: &Alert) {
        self.ledger.forget(&alert.event_id);
        for sink in &self.sinks {
            sink.abandon(alert);
        }
    }
}

/// In-memory sink for tests and embedding
#[derive(Default)]
pub struct MemorySink {
    alerts: Mutex<Vec<Alert>>,
    logs: Mutex<Vec<LogEvent>>,
    failures_remaining: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn logs(&self) -> Vec<LogEvent> {
        self.logs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AlertSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, alert: &Alert) -> Result<(), SinkError> {
        if self.take_failure() {
            return Err(SinkError::Rejected("injected failure".to_string()));
        }
        self.alerts.lock().push(alert.clone());
        Ok(())
    }

    async fn forward_log(&self, event: &LogEvent) -> Result<(), SinkError> {
        self.logs.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};

    fn create_alert(id: &str) -> Alert {
        let event = LogEvent {
            id: id.to_string(),
            timestamp: Utc::now(),
            source: "test".to_string(),
            raw_text: "Failed password".to_string(),
            parsed_fields: BTreeMap::new(),
            parse_ok: false,
            extractor: None,
        };
        let rules: BTreeSet<String> = ["brute_force".to_string()].into_iter().collect();
        Alert::new(&event, Severity::High, rules, None, None).unwrap()
    }

    #[tokio::test]
    async fn test_memory_sink_injected_failures() {
        let sink = MemorySink::new();
        sink.fail_next(2);

        assert!(sink.put(&create_alert("a")).await.is_err());
        assert!(sink.put(&create_alert("a")).await.is_err());
        assert!(sink.put(&create_alert("a")).await.is_ok());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_fanout_delivers_to_all_and_reports_failure() {
        let good = Arc::new(MemorySink::new());
        let bad = Arc::new(MemorySink::new());
        bad.fail_next(1);

        let fanout = FanoutSink::new(vec![good.clone() as Arc<dyn AlertSink>, bad.clone()]);
        assert!(fanout.put(&create_alert("a")).await.is_err());
        assert_eq!(good.len(), 1);
        assert_eq!(bad.len(), 0);

        assert!(fanout.put(&create_alert("b")).await.is_ok());
        assert_eq!(good.len(), 2);
        assert_eq!(bad.len(), 1);
    }

    #[tokio::test]
    async fn test_fanout_retry_skips_sinks_that_accepted() {
        let good = Arc::new(MemorySink::new());
        let flaky = Arc::new(MemorySink::new());
        flaky.fail_next(1);

        let fanout = FanoutSink::new(vec![good.clone() as Arc<dyn AlertSink>, flaky.clone()]);
        let alert = create_alert("a");

        let err = fanout.put(&alert).await.unwrap_err();
        assert!(err.is_partial());
        assert_eq!(fanout.pending(), 1);

        assert!(fanout.put(&alert).await.is_ok());
        assert_eq!(good.len(), 1);
        assert_eq!(flaky.len(), 1);
        assert_eq!(fanout.pending(), 0);
    }

    #[tokio::test]
    async fn test_fanout_abandon_clears_pending() {
        let good = Arc::new(MemorySink::new());
        let broken = Arc::new(MemorySink::new());
        broken.fail_next(usize::MAX);

        let fanout = FanoutSink::new(vec![good.clone() as Arc<dyn AlertSink>, broken]);
        let alert = create_alert("a");
        assert!(fanout.put(&alert).await.is_err());
        assert_eq!(fanout.pending(), 1);

        fanout.abandon(&alert);
        assert_eq!(fanout.pending(), 0);
        assert_eq!(good.len(), 1);
    }

    #[tokio::test]
    async fn test_fanout_total_failure_is_not_partial() {
        let broken = Arc::new(MemorySink::new());
        broken.fail_next(1);

        let fanout = FanoutSink::new(vec![broken as Arc<dyn AlertSink>]);
        let err = fanout.put(&create_alert("a")).await.unwrap_err();
        assert!(!err.is_partial());
    }
}
