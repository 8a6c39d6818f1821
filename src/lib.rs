pub mod alerting;
pub mod anomaly;
pub mod config;
pub mod detection;
pub mod enrichment;
pub mod input;
pub mod models;
pub mod normalize;
pub mod output;
pub mod persistence;
pub mod pipeline;
pub mod sink;

// Re-export commonly used types
pub use alerting::WebhookSink;
pub use anomaly::{AnomalyScorer, FeatureEncoder, ModelTrainer};
pub use config::{Config, ConfigError};
pub use detection::{RuleEngine, RuleSpec};
pub use enrichment::{Enricher, EnrichmentProvider};
pub use models::{Alert, LogEvent, RawLine, Severity};
pub use normalize::Normalizer;
pub use output::OutputHandler;
pub use persistence::{AlertStore, SqliteAlertStore};
pub use pipeline::{Pipeline, PipelineError, ProcessOutcome};
pub use sink::{AlertSink, FanoutSink, MemorySink};
