//! Training buffer and periodic retraining

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::anomaly::features::{FeatureSchema, FeatureVector};
use crate::anomaly::forest::IsolationForestFitter;
use crate::anomaly::model::{AnomalyModel, OutlierFitter, TrainingError};
use crate::anomaly::scorer::AnomalyScorer;
use crate::config::AnomalyConfig;

/// Recent feature vectors kept for the next retrain.
///
/// Bounded by `max_samples` and by the trailing training window measured
/// from the newest sample.
pub struct TrainingBuffer {
    samples: Mutex<VecDeque<(i64, Vec<f64>)>>,
    max_samples: usize,
    window_ms: i64,
}

impl TrainingBuffer {
    pub fn new(max_samples: usize, window: Duration) -> Self {
        TrainingBuffer {
            samples: Mutex::new(VecDeque::new()),
            max_samples: max_samples.max(1),
            window_ms: window.as_millis() as i64,
        }
    }

    pub fn push(&self, vector: &FeatureVector) {
        let mut samples = self.samples.lock();
        samples.push_back((vector.timestamp_ms, vector.values.clone()));
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    /// Samples inside the training window, oldest first
    pub fn snapshot(&self) -> Vec<Vec<f64>> {
        let mut samples = self.samples.lock();
        let newest = samples.iter().map(|(t, _)| *t).max().unwrap_or_default();
        let cutoff = newest - self.window_ms;
        samples.retain(|(t, _)| *t > cutoff);
        samples.iter().map(|(_, values)| values.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Fits new models from the buffer and publishes them to the scorer
pub struct ModelTrainer {
    buffer: Arc<TrainingBuffer>,
    scorer: Arc<AnomalyScorer>,
    fitter: Arc<dyn OutlierFitter>,
    schema: FeatureSchema,
    decision_threshold: f64,
    training_window: Duration,
    min_samples: usize,
    next_version: AtomicU64,
}

impl ModelTrainer {
    pub fn new(
        buffer: Arc<TrainingBuffer>,
        scorer: Arc<AnomalyScorer>,
        fitter: Arc<dyn OutlierFitter>,
        schema: FeatureSchema,
        config: &AnomalyConfig,
    ) -> Self {
        ModelTrainer {
            buffer,
            scorer,
            fitter,
            schema,
            decision_threshold: config.decision_threshold,
            training_window: config.training_window(),
            min_samples: config.min_samples,
            next_version: AtomicU64::new(1),
        }
    }

    /// Trainer using the isolation forest settings from configuration
    pub fn from_config(
        buffer: Arc<TrainingBuffer>,
        scorer: Arc<AnomalyScorer>,
        schema: FeatureSchema,
        config: &AnomalyConfig,
    ) -> Self {
        let fitter = IsolationForestFitter::new(config.trees, config.sample_size, config.seed);
        Self::new(buffer, scorer, Arc::new(fitter), schema, config)
    }

    /// Fit a model on the buffered window without publishing it
    pub fn fit(&self) -> Result<AnomalyModel, TrainingError> {
        let samples = self.buffer.snapshot();
        if samples.len() < self.min_samples.max(2) {
            return Err(TrainingError::InsufficientSamples {
                have: samples.len(),
                need: self.min_samples.max(2),
            });
        }

        let detector = self.fitter.fit(&samples)?;
        Ok(AnomalyModel {
            version: self.next_version.fetch_add(1, Ordering::SeqCst),
            feature_schema: self.schema.clone(),
            trained_at: Utc::now(),
            training_window: self.training_window,
            decision_threshold: self.decision_threshold,
            sample_count: samples.len(),
            detector,
        })
    }

    /// Fit on a blocking thread and publish the result.
    ///
    /// On failure the previously published model stays in place.
    pub async fn retrain(self: &Arc<Self>) -> Result<Arc<AnomalyModel>, TrainingError> {
        let trainer = Arc::clone(self);
        let model = tokio::task::spawn_blocking(move || trainer.fit())
            .await
            .map_err(|e| TrainingError::Task(e.to_string()))??;

        let model = Arc::new(model);
        self.scorer.publish(model.clone());
        Ok(model)
    }

    /// Retrain on a fixed interval until `shutdown` flips to true
    pub fn spawn_retrain_loop(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.retrain().await {
                            Ok(model) => log::info!("Retrained anomaly model v{}", model.version),
                            Err(e) => log::warn!("Anomaly model retrain skipped: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            log::debug!("Retrain loop stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
