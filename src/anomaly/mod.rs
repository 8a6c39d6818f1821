//! Unsupervised anomaly scoring
//!
//! Events are encoded into fixed-shape feature vectors and scored against a
//! periodically retrained outlier model. Until a model has been published
//! every vector is `Unscored`, which the pipeline treats as "no signal".

pub mod features;
pub mod forest;
pub mod model;
pub mod scorer;
pub mod trainer;

pub use features::{Feature, FeatureEncoder, FeatureSchema, FeatureVector};
pub use forest::{IsolationForest, IsolationForestFitter, StandardScaler};
pub use model::{
    AnomalyModel, AnomalyScore, OutlierFitter, OutlierModel, Scoring, TrainingError, UnscoredReason,
};
pub use scorer::AnomalyScorer;
pub use trainer::{ModelTrainer, TrainingBuffer};
