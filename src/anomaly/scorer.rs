//! Scoring against the currently published model

use std::sync::Arc;

use parking_lot::RwLock;

use crate::anomaly::features::FeatureVector;
use crate::anomaly::model::{AnomalyModel, AnomalyScore, Scoring, UnscoredReason};

/// Holds the published model and scores vectors against it.
///
/// Publishing swaps an `Arc` under a write lock held only for the swap, so
/// scoring calls already running keep the model they started with.
#[derive(Default)]
pub struct AnomalyScorer {
    current: RwLock<Option<Arc<AnomalyModel>>>,
}

impl AnomalyScorer {
    pub fn new() -> Self {
        AnomalyScorer {
            current: RwLock::new(None),
        }
    }

    pub fn score(&self, vector: &FeatureVector) -> Scoring {
        let Some(model) = self.current() else {
            return Scoring::Unscored(UnscoredReason::ColdStart);
        };
        if model.feature_schema != vector.schema || vector.values.len() != model.feature_schema.len() {
            return Scoring::Unscored(UnscoredReason::SchemaMismatch);
        }

        let value = model.detector.score(&vector.values).clamp(0.0, 1.0);
        Scoring::Scored(AnomalyScore {
            value,
            threshold: model.decision_threshold,
            model_version: model.version,
        })
    }

    /// Replace the current model; returns the one it replaced
    pub fn publish(&self, model: Arc<AnomalyModel>) -> Option<Arc<AnomalyModel>> {
        log::info!(
            "Publishing anomaly model v{} ({} samples, threshold {:.2})",
            model.version,
            model.sample_count,
            model.decision_threshold
        );
        self.current.write().replace(model)
    }

    pub fn current(&self) -> Option<Arc<AnomalyModel>> {
        self.current.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::features::FeatureSchema;
    use crate::anomaly::model::OutlierModel;
    use chrono::Utc;
    use std::time::Duration;

    /// Returns the first value of the vector as its score
    struct Passthrough;

    impl OutlierModel for Passthrough {
        fn score(&self, values: &[f64]) -> f64 {
            values[0]
        }
    }

    fn schema() -> FeatureSchema {
        FeatureSchema::from_names(&["digit_ratio".to_string()]).unwrap()
    }

    fn model(version: u64) -> Arc<AnomalyModel> {
        Arc::new(AnomalyModel {
            version,
            feature_schema: schema(),
            trained_at: Utc::now(),
            training_window: Duration::from_secs(3600),
            decision_threshold: 0.7,
            sample_count: 500,
            detector: Box::new(Passthrough),
        })
    }

    fn vector(value: f64) -> FeatureVector {
        FeatureVector {
            schema: schema(),
            values: vec![value],
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_cold_start_is_unscored() {
        let scorer = AnomalyScorer::new();
        assert!(!scorer.is_ready());
        for value in [0.0, 0.5, 0.99] {
            assert_eq!(scorer.score(&vector(value)), Scoring::Unscored(UnscoredReason::ColdStart));
        }
    }

    #[test]
    fn test_decision_threshold() {
        let scorer = AnomalyScorer::new();
        scorer.publish(model(1));

        let high = scorer.score(&vector(0.9));
        let low = scorer.score(&vector(0.5));
        assert!(high.is_anomalous());
        assert!(!low.is_anomalous());
        assert_eq!(high.score().map(|s| s.model_version), Some(1));
        assert!(scorer.score(&vector(0.7)).is_anomalous());
    }

    #[test]
    fn test_schema_mismatch_is_unscored() {
        let scorer = AnomalyScorer::new();
        scorer.publish(model(1));

        let other = FeatureVector {
            schema: FeatureSchema::full(),
            values: vec![0.9; 12],
            timestamp_ms: 0,
        };
        assert_eq!(scorer.score(&other), Scoring::Unscored(UnscoredReason::SchemaMismatch));
    }

    #[test]
    fn test_publish_swaps_and_readers_keep_old_model() {
        let scorer = AnomalyScorer::new();
        scorer.publish(model(1));

        let held = scorer.current().unwrap();
        let previous = scorer.publish(model(2)).unwrap();

        assert_eq!(held.version, 1);
        assert_eq!(previous.version, 1);
        assert_eq!(scorer.score(&vector(0.1)).score().map(|s| s.model_version), Some(2));
    }
}
