//! Alert enrichment
//!
//! An enrichment provider explains why an alert-worthy event matters and
//! suggests a severity. Providers are slow and unreliable by nature, so every
//! call goes through the [`Enricher`], which applies a timeout and a circuit
//! breaker and never lets a provider failure drop an alert.

pub mod breaker;
pub mod enricher;
pub mod heuristic;
pub mod http;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::anomaly::AnomalyScore;
use crate::models::{LogEvent, Severity};

pub use breaker::{CircuitBreaker, CircuitState};
pub use enricher::{EnrichmentOutcome, Enricher};
pub use heuristic::HeuristicProvider;
pub use http::HttpProvider;

/// Errors raised by an enrichment provider call
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

/// What the provider is asked to explain
#[derive(Debug, Clone)]
pub struct DetectionContext {
    pub event: Arc<LogEvent>,
    pub rule_hits: BTreeSet<String>,
    pub anomaly_score: Option<AnomalyScore>,
}

impl DetectionContext {
    pub fn is_anomalous(&self) -> bool {
        self.anomaly_score.map_or(false, |s| s.is_anomalous())
    }

    /// Severity used when no provider explanation is available
    pub fn fallback_severity(&self) -> Severity {
        Severity::fallback(&self.rule_hits, self.is_anomalous())
    }
}

/// A provider's answer
#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub severity: Severity,
    pub explanation: String,
    /// In `[0, 1]`
    pub confidence: f64,
    pub recommendation: Option<String>,
}

/// A contextual-analysis backend
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Stable identifier recorded on enriched alerts
    fn id(&self) -> &str;

    async fn explain(&self, context: &DetectionContext) -> Result<Explanation, EnrichmentError>;
}
