//! Event orchestration
//!
//! The pipeline runs every raw line through normalization, deduplication,
//! rule evaluation and anomaly scoring. Events that clear the emission policy
//! become alert candidates on a bounded queue served by enrichment workers;
//! everything else is optionally forwarded as a plain log record.

pub mod dedup;
pub mod queue;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::anomaly::{
    AnomalyScorer, FeatureEncoder, FeatureSchema, ModelTrainer, Scoring, TrainingBuffer, UnscoredReason,
};
use crate::config::{AnomalyConfig, BackpressurePolicy, Config, ConfigError, PipelineConfig};
use crate::detection::RuleEngine;
use crate::enrichment::{DetectionContext, Enricher, EnrichmentError, EnrichmentOutcome, Explanation};
use crate::models::{Alert, LogEvent, RawLine};
use crate::normalize::Normalizer;
use crate::sink::AlertSink;

pub use dedup::DedupFilter;
pub use queue::EnrichmentQueue;
pub use stats::{PipelineStats, StatsSnapshot};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Enrichment setup error: {0}")]
    Enrichment(#[from] EnrichmentError),
}

/// An alert-worthy event waiting for enrichment
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub context: DetectionContext,
}

/// What happened to one raw line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The event id was already processed
    Duplicate,
    /// The pipeline is shutting down
    Stopped,
    /// No detection signal; at most forwarded as a log record
    Logged,
    /// An alert was queued or emitted
    Alerted,
}

pub struct Pipeline {
    config: PipelineConfig,
    anomaly_enabled: bool,
    normalizer: Normalizer,
    dedup: DedupFilter,
    rule_engine: RuleEngine,
    encoder: FeatureEncoder,
    scorer: Arc<AnomalyScorer>,
    training: Arc<TrainingBuffer>,
    enricher: Enricher,
    sink: Arc<dyn AlertSink>,
    stats: PipelineStats,
    queue: EnrichmentQueue<AlertCandidate>,
    accepting: AtomicBool,
    cold_start_logged: AtomicBool,
    force: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build every stage from configuration.
    ///
    /// Fails on invalid rules, patterns, feature names or enrichment settings;
    /// nothing is processed until all of them are valid.
    pub fn new(config: &Config, sink: Arc<dyn AlertSink>) -> Result<Self, PipelineError> {
        let schema = FeatureSchema::from_names(&config.anomaly.features)?;
        let (force, _) = watch::channel(false);

        Ok(Pipeline {
            config: config.pipeline.clone(),
            anomaly_enabled: config.anomaly.enabled,
            normalizer: Normalizer::from_config(&config.normalizer)?,
            dedup: DedupFilter::new(config.pipeline.dedup_capacity),
            rule_engine: RuleEngine::from_config(config)?,
            encoder: FeatureEncoder::new(schema),
            scorer: Arc::new(AnomalyScorer::new()),
            training: Arc::new(TrainingBuffer::new(
                config.anomaly.max_samples,
                config.anomaly.training_window(),
            )),
            enricher: Enricher::from_config(&config.enrichment)?,
            sink,
            stats: PipelineStats::new(),
            queue: EnrichmentQueue::new(config.pipeline.enrichment_queue_capacity),
            accepting: AtomicBool::new(true),
            cold_start_logged: AtomicBool::new(false),
            force,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Replace the configured enricher
    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn scorer(&self) -> &Arc<AnomalyScorer> {
        &self.scorer
    }

    pub fn training_buffer(&self) -> &Arc<TrainingBuffer> {
        &self.training
    }

    pub fn rule_engine(&self) -> &RuleEngine {
        &self.rule_engine
    }

    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    pub fn enricher(&self) -> &Enricher {
        &self.enricher
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// A trainer that fits from this pipeline's buffer and publishes to its scorer
    pub fn model_trainer(&self, config: &AnomalyConfig) -> Arc<ModelTrainer> {
        Arc::new(ModelTrainer::from_config(
            self.training.clone(),
            self.scorer.clone(),
            self.encoder.schema().clone(),
            config,
        ))
    }

    /// Feed a historical line to the training buffer only
    pub fn learn(&self, raw: &RawLine) {
        let event = self.normalizer.normalize(raw);
        self.training.push(&self.encoder.encode(&event));
    }

    /// Spawn the enrichment workers
    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        for id in 0..self.config.enrichment_workers.max(1) {
            let pipeline = Arc::clone(self);
            workers.push(tokio::spawn(async move { pipeline.work(id).await }));
        }
        log::info!("Started {} enrichment workers", workers.len());
    }

    /// Consume lines until the channel closes or `shutdown` flips to true
    pub async fn run(&self, mut rx: mpsc::Receiver<RawLine>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                raw = rx.recv() => match raw {
                    Some(raw) => {
                        self.process(raw).await;
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("Pipeline input loop finished");
    }

    /// Process one raw line
    pub async fn process(&self, raw: RawLine) -> ProcessOutcome {
        if !self.accepting.load(Ordering::SeqCst) {
            return ProcessOutcome::Stopped;
        }

        let event = self.normalizer.normalize(&raw);
        if !self.dedup.first_sighting(&event.id) {
            log::debug!("Duplicate event {} ignored", event.id);
            self.stats.record_duplicate();
            return ProcessOutcome::Duplicate;
        }

        self.stats.record_processed();
        if !event.parse_ok {
            self.stats.record_unparsed();
        }

        let rule_hits = self.rule_engine.evaluate(&event);
        let scoring = self.score(&event);

        if rule_hits.is_empty() && !scoring.is_anomalous() {
            if self.config.forward_logs {
                if let Err(e) = self.sink.forward_log(&event).await {
                    log::warn!("Failed to forward log record {}: {}", event.id, e);
                }
            }
            return ProcessOutcome::Logged;
        }

        let candidate = AlertCandidate {
            context: DetectionContext {
                event: Arc::new(event),
                rule_hits,
                anomaly_score: scoring.score().copied(),
            },
        };
        self.dispatch(candidate).await;
        ProcessOutcome::Alerted
    }

    fn score(&self, event: &LogEvent) -> Scoring {
        if !self.anomaly_enabled {
            return Scoring::Unscored(UnscoredReason::Disabled);
        }

        let vector = self.encoder.encode(event);
        self.training.push(&vector);

        let scoring = self.scorer.score(&vector);
        match scoring {
            Scoring::Unscored(UnscoredReason::ColdStart) => {
                if !self.cold_start_logged.swap(true, Ordering::Relaxed) {
                    log::warn!("No anomaly model published yet, detecting with rules only");
                }
            }
            Scoring::Unscored(UnscoredReason::SchemaMismatch) => {
                log::debug!("Event {} not scored: model schema differs from encoder", event.id);
            }
            _ => {}
        }
        scoring
    }

    /// Queue a candidate for enrichment, applying the backpressure policy
    async fn dispatch(&self, candidate: AlertCandidate) {
        if self.enricher.provider_id().is_none() {
            self.emit(&candidate, None).await;
            return;
        }

        let bypass = match self.config.backpressure {
            BackpressurePolicy::DropOldest => match self.queue.push_evicting(candidate) {
                Ok(evicted) => evicted,
                Err(rejected) => Some(rejected),
            },
            BackpressurePolicy::Block => self
                .queue
                .push_timeout(candidate, self.config.block_timeout())
                .await
                .err(),
        };

        if let Some(candidate) = bypass {
            if self.queue.is_closed() {
                log::debug!("Queue closed, emitting event {} unenriched", candidate.context.event.id);
            } else {
                log::warn!(
                    "Enrichment queue full ({}), emitting event {} unenriched",
                    self.queue.capacity(),
                    candidate.context.event.id
                );
                self.stats.record_overflow();
            }
            self.emit(&candidate, None).await;
        }
    }

    async fn work(self: Arc<Self>, id: usize) {
        let mut force = self.force.subscribe();
        log::debug!("Enrichment worker {} started", id);

        loop {
            let candidate = tokio::select! {
                biased;
                _ = force.wait_for(|forced| *forced) => break,
                candidate = self.queue.pop() => candidate,
            };
            let Some(candidate) = candidate else {
                break;
            };

            let explanation = tokio::select! {
                outcome = self.enricher.enrich(&candidate.context) => self.account(outcome),
                _ = force.wait_for(|forced| *forced) => {
                    log::warn!("Enrichment of event {} abandoned at shutdown", candidate.context.event.id);
                    None
                }
            };
            self.emit(&candidate, explanation.as_ref()).await;
        }

        log::debug!("Enrichment worker {} stopped", id);
    }

    fn account(&self, outcome: EnrichmentOutcome) -> Option<Explanation> {
        match outcome {
            EnrichmentOutcome::Enriched(explanation) => Some(explanation),
            EnrichmentOutcome::ShortCircuited => {
                self.stats.record_short_circuit();
                None
            }
            EnrichmentOutcome::TimedOut | EnrichmentOutcome::Failed(_) => {
                self.stats.record_enrichment_failure();
                None
            }
            EnrichmentOutcome::Disabled => None,
        }
    }

    /// Assemble the alert and deliver it
    async fn emit(&self, candidate: &AlertCandidate, explanation: Option<&Explanation>) {
        let context = &candidate.context;
        let severity = explanation.map_or_else(|| context.fallback_severity(), |e| e.severity);
        let enrichment = explanation.map(|e| self.enricher.to_enrichment(e));

        let Some(alert) = Alert::new(
            &context.event,
            severity,
            context.rule_hits.clone(),
            context.anomaly_score.map(|s| s.value),
            enrichment,
        ) else {
            log::warn!("Event {} carried no detection signal, not alerting", context.event.id);
            return;
        };

        self.deliver(&alert).await;
    }

    /// Write to the sink with bounded retries and exponential backoff
    async fn deliver(&self, alert: &Alert) -> bool {
        let mut backoff = self.config.sink_backoff();
        let mut attempt = 0;

        loop {
            match self.sink.put(alert).await {
                Ok(()) => {
                    self.stats.record_alert();
                    return true;
                }
                Err(e) if attempt < self.config.sink_retries => {
                    attempt += 1;
                    log::warn!(
                        "Sink write for alert {} failed (attempt {}): {}, retrying in {:?}",
                        alert.event_id,
                        attempt,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    self.sink.abandon(alert);
                    if e.is_partial() {
                        log::error!(
                            "Alert {} only partially delivered after {} attempts: {}",
                            alert.event_id,
                            attempt + 1,
                            e
                        );
                        self.stats.record_partial_delivery();
                    } else {
                        log::error!(
                            "Alert {} undeliverable after {} attempts, dropping: {}",
                            alert.event_id,
                            attempt + 1,
                            e
                        );
                        self.stats.record_undeliverable();
                    }
                    return false;
                }
            }
        }
    }

    /// Expire idle detection state; returns the number of rule windows dropped
    pub fn maintenance(&self, now_ms: i64) -> usize {
        let expired = self.rule_engine.prune_stale(now_ms);
        self.encoder.prune_stale(now_ms);
        log::debug!(
            "Maintenance: {} rule windows expired, {} still tracked",
            expired,
            self.rule_engine.tracked_keys()
        );
        expired
    }

    /// Stop accepting events and finish every pending alert.
    ///
    /// Workers get the shutdown grace period to drain the queue; after that
    /// in-flight enrichment is abandoned and whatever remains is emitted
    /// without enrichment.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down pipeline, {} alerts awaiting enrichment", self.queue.len());
        self.queue.close();

        let mut workers = std::mem::take(&mut *self.workers.lock());
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(handle) = workers.last_mut() {
                if let Err(e) = handle.await {
                    log::error!("Enrichment worker failed: {}", e);
                }
                workers.pop();
            }
        })
        .await;

        if drained.is_err() {
            log::warn!(
                "Shutdown grace of {:?} expired, completing remaining alerts without enrichment",
                grace
            );
            self.force.send_replace(true);
            for handle in workers {
                if let Err(e) = handle.await {
                    log::error!("Enrichment worker failed: {}", e);
                }
            }
        }

        for candidate in self.queue.drain() {
            self.emit(&candidate, None).await;
        }

        if let Err(e) = self.sink.flush().await {
            log::error!("Failed to flush sink: {}", e);
        }
        log::info!("Pipeline stopped: {}", self.stats.snapshot());
    }
}
