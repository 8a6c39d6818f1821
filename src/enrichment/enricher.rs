//! Timeout and circuit breaker around an enrichment provider

use std::sync::Arc;
use std::time::Duration;

use crate::config::{EnrichmentConfig, ProviderKind};
use crate::enrichment::breaker::{CircuitBreaker, CircuitState};
use crate::enrichment::heuristic::HeuristicProvider;
use crate::enrichment::http::HttpProvider;
use crate::enrichment::{DetectionContext, EnrichmentError, EnrichmentProvider, Explanation};
use crate::models::Enrichment;

/// How one enrichment attempt ended
#[derive(Debug)]
pub enum EnrichmentOutcome {
    Enriched(Explanation),
    /// The breaker is open; the provider was not called
    ShortCircuited,
    TimedOut,
    Failed(EnrichmentError),
    /// No provider is configured
    Disabled,
}

impl EnrichmentOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, EnrichmentOutcome::TimedOut | EnrichmentOutcome::Failed(_))
    }
}

pub struct Enricher {
    provider: Option<Arc<dyn EnrichmentProvider>>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl Enricher {
    pub fn new(provider: Arc<dyn EnrichmentProvider>, timeout: Duration, breaker: CircuitBreaker) -> Self {
        Enricher {
            provider: Some(provider),
            breaker,
            timeout,
        }
    }

    /// An enricher that never calls anything
    pub fn disabled() -> Self {
        Enricher {
            provider: None,
            breaker: CircuitBreaker::new(1, Duration::ZERO),
            timeout: Duration::ZERO,
        }
    }

    pub fn from_config(config: &EnrichmentConfig) -> Result<Self, EnrichmentError> {
        let provider: Arc<dyn EnrichmentProvider> = match config.provider {
            ProviderKind::Disabled => return Ok(Self::disabled()),
            ProviderKind::Heuristic => Arc::new(HeuristicProvider::new()),
            ProviderKind::Http => Arc::new(HttpProvider::from_config(config)?),
        };
        log::info!(
            "Enrichment provider '{}' (timeout {:?}, breaker threshold {})",
            provider.id(),
            config.timeout(),
            config.failure_threshold
        );
        let breaker = CircuitBreaker::new(config.failure_threshold, config.open_cooldown());
        Ok(Self::new(provider, config.timeout(), breaker))
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.id())
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub async fn enrich(&self, context: &DetectionContext) -> EnrichmentOutcome {
        let Some(ref provider) = self.provider else {
            return EnrichmentOutcome::Disabled;
        };

        if !self.breaker.allow_request() {
            log::debug!("Enrichment short-circuited for event {}", context.event.id);
            return EnrichmentOutcome::ShortCircuited;
        }

        match tokio::time::timeout(self.timeout, provider.explain(context)).await {
            Ok(Ok(explanation)) => {
                self.breaker.record_success();
                EnrichmentOutcome::Enriched(explanation)
            }
            Ok(Err(e)) => {
                log::warn!("Enrichment failed for event {}: {}", context.event.id, e);
                self.breaker.record_failure();
                EnrichmentOutcome::Failed(e)
            }
            Err(_) => {
                log::warn!(
                    "Enrichment timed out after {:?} for event {}",
                    self.timeout,
                    context.event.id
                );
                self.breaker.record_failure();
                EnrichmentOutcome::TimedOut
            }
        }
    }

    /// Turn a successful outcome into the alert's enrichment record
    pub fn to_enrichment(&self, explanation: &Explanation) -> Enrichment {
        Enrichment {
            explanation: explanation.explanation.clone(),
            confidence: explanation.confidence,
            provider: self.provider_id().unwrap_or("none").to_string(),
            recommendation: explanation.recommendation.clone(),
        }
    }
}
