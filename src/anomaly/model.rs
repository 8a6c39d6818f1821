//! Anomaly model artifact and the outlier detector seam

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::anomaly::features::FeatureSchema;

/// Why a model could not be trained
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Insufficient training samples: have {have}, need {need}")]
    InsufficientSamples { have: usize, need: usize },

    #[error("Training data is unusable: {0}")]
    InvalidData(String),

    #[error("Training task failed: {0}")]
    Task(String),
}

/// A fitted detector. Higher scores mean more anomalous, in `[0, 1]`.
pub trait OutlierModel: Send + Sync {
    fn score(&self, values: &[f64]) -> f64;
}

/// Fits an [`OutlierModel`] on a set of samples
pub trait OutlierFitter: Send + Sync {
    fn fit(&self, samples: &[Vec<f64>]) -> Result<Box<dyn OutlierModel>, TrainingError>;
}

/// A versioned, immutable trained model
pub struct AnomalyModel {
    pub version: u64,
    pub feature_schema: FeatureSchema,
    pub trained_at: DateTime<Utc>,
    pub training_window: Duration,
    pub decision_threshold: f64,
    pub sample_count: usize,
    pub detector: Box<dyn OutlierModel>,
}

impl std::fmt::Debug for AnomalyModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyModel")
            .field("version", &self.version)
            .field("features", &self.feature_schema.names())
            .field("trained_at", &self.trained_at)
            .field("decision_threshold", &self.decision_threshold)
            .field("sample_count", &self.sample_count)
            .finish()
    }
}

/// Why an event carries no anomaly signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnscoredReason {
    /// No model has been published yet
    ColdStart,
    /// The vector was built for a different feature schema than the model
    SchemaMismatch,
    /// Anomaly detection is turned off
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyScore {
    pub value: f64,
    pub threshold: f64,
    pub model_version: u64,
}

impl AnomalyScore {
    pub fn is_anomalous(&self) -> bool {
        self.value >= self.threshold
    }
}

/// Result of scoring one feature vector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scoring {
    Unscored(UnscoredReason),
    Scored(AnomalyScore),
}

impl Scoring {
    pub fn score(&self) -> Option<&AnomalyScore> {
        match self {
            Scoring::Scored(score) => Some(score),
            Scoring::Unscored(_) => None,
        }
    }

    pub fn is_anomalous(&self) -> bool {
        self.score().map_or(false, AnomalyScore::is_anomalous)
    }
}
