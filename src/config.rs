use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::anomaly::FeatureSchema;
use crate::detection::RuleSpec;
use crate::models::Severity;
use crate::normalize::Normalizer;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal and are reported before any event is processed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Unknown feature '{0}' in anomaly feature schema")]
    UnknownFeature(String),

    #[error("Invalid normalizer pattern '{name}': {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration for the Huginn daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input source configuration
    pub input: InputConfig,
    /// Custom normalizer patterns
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    /// Rule engine tuning
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Correlation rules
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,
    /// Anomaly scoring configuration
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    /// Enrichment provider configuration
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    /// Pipeline concurrency and delivery configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Output configuration
    pub output: OutputConfig,
    /// Alert store configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Generic webhooks receiving every alert
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

/// Input source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Type of input source: "file" or "syslog"
    pub source_type: String,
    /// Path to log file (if source_type is "file")
    pub file_path: Option<PathBuf>,
    /// Syslog bind address (if source_type is "syslog")
    pub syslog_address: Option<String>,
    /// Capacity of the channel between the collector and the pipeline
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Operator supplied extractors, tried before the built-in ones
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
}

/// A named regex whose named capture groups become event fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub name: String,
    pub regex: String,
}

/// Rule engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// How far behind the newest event of a key an event may arrive and still count
    pub max_out_of_order_seconds: u64,
    /// Idle time after which per-key window state is discarded
    pub idle_expiry_seconds: u64,
}

/// A threshold-within-window correlation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    /// Field used as grouping key, e.g. "source_ip" or "user"
    pub group_by: String,
    /// Number of matching events within the window that fires the rule
    pub threshold: usize,
    pub window_seconds: u64,
    /// Minimum time between two firings for the same key
    pub cooldown_seconds: u64,
    /// Which events count toward the rule
    #[serde(default)]
    pub when: PredicateConfig,
}

/// Conditions an event must satisfy to count toward a rule.
///
/// Every non-empty condition must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredicateConfig {
    /// Message contains any of these substrings (case-insensitive)
    #[serde(default)]
    pub message_contains: Vec<String>,
    /// Message matches this regex
    #[serde(default)]
    pub message_regex: Option<String>,
    /// Fields equal these values (case-insensitive)
    #[serde(default)]
    pub field_equals: BTreeMap<String, String>,
    /// Fields that must be present
    #[serde(default)]
    pub field_present: Vec<String>,
}

/// Anomaly scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub enabled: bool,
    /// Scores at or above this value are anomalous
    pub decision_threshold: f64,
    /// Trailing span of history used for training
    pub training_window_seconds: u64,
    pub retrain_interval_seconds: u64,
    /// Minimum number of samples required to fit a model
    pub min_samples: usize,
    /// Upper bound on buffered training samples
    pub max_samples: usize,
    /// Number of isolation trees
    pub trees: usize,
    /// Sub-sample size per tree
    pub sample_size: usize,
    pub seed: u64,
    /// Ordered feature names; empty means the full built-in schema
    #[serde(default)]
    pub features: Vec<String>,
    /// Historical log file used to train a model at startup
    #[serde(default)]
    pub bootstrap_file: Option<PathBuf>,
}

/// Enrichment provider selected at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Disabled,
    /// Local keyword analyzer
    Heuristic,
    /// Hosted analysis API reached over HTTP
    Http,
}

/// Enrichment provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    pub provider: ProviderKind,
    /// Mandatory timeout for every provider call
    pub timeout_ms: u64,
    /// Consecutive failures before the provider is short-circuited
    pub failure_threshold: u32,
    /// How long the provider stays short-circuited before a probe call
    pub open_cooldown_seconds: u64,
    /// Endpoint of the hosted provider
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the hosted provider's API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Model name forwarded to the hosted provider
    #[serde(default)]
    pub model: Option<String>,
}

/// What to do when the enrichment queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait up to `block_timeout_ms` for room, then emit the alert unenriched
    Block,
    /// Evict the oldest queued alert and emit it unenriched
    DropOldest,
}

/// Pipeline concurrency and delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of recently seen event ids remembered for deduplication
    pub dedup_capacity: usize,
    pub enrichment_workers: usize,
    pub enrichment_queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub block_timeout_ms: u64,
    /// Time allowed for in-flight enrichment to finish on shutdown
    pub shutdown_grace_seconds: u64,
    /// Retries after the first failed sink write
    pub sink_retries: u32,
    /// Initial retry backoff, doubled on every attempt
    pub sink_backoff_ms: u64,
    /// Forward events that raised no alert to the sink's log path
    pub forward_logs: bool,
    pub maintenance_interval_seconds: u64,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "json", "jsonl", or "console"
    pub format: String,
    /// Output file path (if format is not "console")
    pub file_path: Option<PathBuf>,
}

/// Alert store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path; alerts are not persisted when unset
    pub sqlite_path: Option<PathBuf>,
    /// Alerts and log records older than this are pruned
    pub retention_days: u32,
}

/// Generic webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    /// HTTP method, "POST" (default) or "PUT"
    pub method: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    /// Alerts below this severity are not sent
    #[serde(default)]
    pub min_severity: Option<Severity>,
    /// Per-request timeout
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_webhook_timeout_ms() -> u64 {
    5000
}

/// The built-in brute force rule
fn default_rules() -> Vec<RuleConfig> {
    vec![RuleConfig {
        name: "brute_force".to_string(),
        group_by: "source_ip".to_string(),
        threshold: 3,
        window_seconds: 60,
        cooldown_seconds: 300,
        when: PredicateConfig {
            message_contains: vec!["failed".to_string(), "authentication failure".to_string()],
            ..PredicateConfig::default()
        },
    }]
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            max_out_of_order_seconds: 30,
            idle_expiry_seconds: 3600,
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        AnomalyConfig {
            enabled: true,
            decision_threshold: 0.7,
            training_window_seconds: 7 * 24 * 3600,
            retrain_interval_seconds: 3600,
            min_samples: 256,
            max_samples: 50_000,
            trees: 100,
            sample_size: 256,
            seed: 42,
            features: Vec::new(),
            bootstrap_file: None,
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        EnrichmentConfig {
            provider: ProviderKind::Heuristic,
            timeout_ms: 2000,
            failure_threshold: 5,
            open_cooldown_seconds: 30,
            endpoint: None,
            api_key_env: None,
            model: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            dedup_capacity: 100_000,
            enrichment_workers: 4,
            enrichment_queue_capacity: 1024,
            backpressure: BackpressurePolicy::Block,
            block_timeout_ms: 250,
            shutdown_grace_seconds: 10,
            sink_retries: 3,
            sink_backoff_ms: 200,
            forward_logs: false,
            maintenance_interval_seconds: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            sqlite_path: None,
            retention_days: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input: InputConfig {
                source_type: "file".to_string(),
                file_path: Some(PathBuf::from("/var/log/auth.log")),
                syslog_address: None,
                channel_capacity: default_channel_capacity(),
            },
            normalizer: NormalizerConfig::default(),
            detection: DetectionConfig::default(),
            rules: default_rules(),
            anomaly: AnomalyConfig::default(),
            enrichment: EnrichmentConfig::default(),
            pipeline: PipelineConfig::default(),
            output: OutputConfig {
                format: "jsonl".to_string(),
                file_path: Some(PathBuf::from("alerts.jsonl")),
            },
            storage: StorageConfig {
                sqlite_path: Some(PathBuf::from("huginn.db")),
                ..StorageConfig::default()
            },
            webhooks: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check every setting that would otherwise fail at runtime.
    ///
    /// Rules, custom patterns and the feature schema are compiled here so
    /// that mistakes surface before the first event is read.
    pub fn validate(&self) -> Result<(), ConfigError> {
        RuleSpec::compile_all(&self.rules)?;
        Normalizer::from_config(&self.normalizer)?;
        FeatureSchema::from_names(&self.anomaly.features)?;

        let threshold = self.anomaly.decision_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                field: "anomaly.decision_threshold",
                reason: format!("{} is outside [0, 1]", threshold),
            });
        }
        if self.anomaly.sample_size < 2 || self.anomaly.trees == 0 {
            return Err(ConfigError::Invalid {
                field: "anomaly.trees/sample_size",
                reason: "need at least one tree and a sample size of 2".to_string(),
            });
        }
        if self.anomaly.min_samples > self.anomaly.max_samples {
            return Err(ConfigError::Invalid {
                field: "anomaly.min_samples",
                reason: "min_samples exceeds max_samples".to_string(),
            });
        }
        if self.anomaly.training_window_seconds == 0 || self.anomaly.retrain_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "anomaly.training_window_seconds",
                reason: "training window and retrain interval must be positive".to_string(),
            });
        }
        if self.enrichment.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "enrichment.timeout_ms",
                reason: "a provider timeout is mandatory".to_string(),
            });
        }
        if self.enrichment.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "enrichment.failure_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.enrichment.provider == ProviderKind::Http && self.enrichment.endpoint.is_none() {
            return Err(ConfigError::Invalid {
                field: "enrichment.endpoint",
                reason: "the http provider requires an endpoint".to_string(),
            });
        }
        if self.pipeline.enrichment_workers == 0 || self.pipeline.enrichment_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.enrichment_workers",
                reason: "workers and queue capacity must be positive".to_string(),
            });
        }
        if self.pipeline.dedup_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.dedup_capacity",
                reason: "must be positive".to_string(),
            });
        }
        if let Some(hook) = self
            .webhooks
            .iter()
            .find(|w| !w.url.starts_with("http://") && !w.url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid {
                field: "webhooks.url",
                reason: format!("webhook '{}' needs an http(s) url", hook.name),
            });
        }
        if let Some(hook) = self.webhooks.iter().find(|w| w.timeout_ms == 0) {
            return Err(ConfigError::Invalid {
                field: "webhooks.timeout_ms",
                reason: format!("webhook '{}' needs a positive timeout", hook.name),
            });
        }
        match self.input.source_type.as_str() {
            "file" if self.input.file_path.is_none() => Err(ConfigError::Invalid {
                field: "input.file_path",
                reason: "file input requires a path".to_string(),
            }),
            "syslog" if self.input.syslog_address.is_none() => Err(ConfigError::Invalid {
                field: "input.syslog_address",
                reason: "syslog input requires a bind address".to_string(),
            }),
            "file" | "syslog" => Ok(()),
            other => Err(ConfigError::Invalid {
                field: "input.source_type",
                reason: format!("unknown source type '{}'", other),
            }),
        }
    }
}

impl DetectionConfig {
    pub fn max_out_of_order(&self) -> Duration {
        Duration::from_secs(self.max_out_of_order_seconds)
    }

    pub fn idle_expiry(&self) -> Duration {
        Duration::from_secs(self.idle_expiry_seconds)
    }
}

impl AnomalyConfig {
    pub fn training_window(&self) -> Duration {
        Duration::from_secs(self.training_window_seconds)
    }

    pub fn retrain_interval(&self) -> Duration {
        Duration::from_secs(self.retrain_interval_seconds)
    }
}

impl EnrichmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn open_cooldown(&self) -> Duration {
        Duration::from_secs(self.open_cooldown_seconds)
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PipelineConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn sink_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_backoff_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].name, "brute_force");
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huginn.toml");

        let mut config = Config::default();
        config.pipeline.backpressure = BackpressurePolicy::DropOldest;
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.pipeline.backpressure, BackpressurePolicy::DropOldest);
        assert_eq!(loaded.rules[0].threshold, 3);
        assert_eq!(loaded.enrichment.provider, ProviderKind::Heuristic);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let toml = r#"
            [input]
            source_type = "syslog"
            syslog_address = "0.0.0.0:5514"

            [output]
            format = "console"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.rules[0].name, "brute_force");
        assert_eq!(config.anomaly.decision_threshold, 0.7);
        assert_eq!(config.input.channel_capacity, 4096);
    }

    #[test]
    fn test_rules_from_toml() {
        let toml = r#"
            [input]
            source_type = "file"
            file_path = "/var/log/auth.log"

            [output]
            format = "jsonl"

            [[rules]]
            name = "root_login_attempts"
            group_by = "user"
            threshold = 5
            window_seconds = 120
            cooldown_seconds = 600

            [rules.when]
            field_equals = { user = "root", outcome = "failure" }
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].when.field_equals.get("user").map(String::as_str), Some("root"));
    }

    #[test]
    fn test_invalid_rule_is_fatal() {
        let mut config = Config::default();
        config.rules[0].threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRule { .. })));
    }

    #[test]
    fn test_unknown_feature_is_fatal() {
        let mut config = Config::default();
        config.anomaly.features = vec!["hour_of_day".to_string(), "moon_phase".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::UnknownFeature(name)) if name == "moon_phase"));
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let mut config = Config::default();
        config.enrichment.provider = ProviderKind::Http;
        assert!(config.validate().is_err());

        config.enrichment.endpoint = Some("http://localhost:8080/explain".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let mut config = Config::default();
        config.anomaly.decision_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_webhook_url_must_be_http() {
        let mut config = Config::default();
        config.webhooks.push(WebhookConfig {
            name: "siem".to_string(),
            url: "ftp://siem.local/ingest".to_string(),
            method: None,
            headers: None,
            min_severity: Some(Severity::High),
            timeout_ms: 1500,
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "webhooks.url", .. })));

        config.webhooks[0].url = "https://siem.local/ingest".to_string();
        assert!(config.validate().is_ok());

        config.webhooks[0].timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "webhooks.timeout_ms", .. })
        ));
    }

    #[test]
    fn test_webhook_timeout_defaults_when_omitted() {
        let hook: WebhookConfig = toml::from_str(
            r#"
            name = "siem"
            url = "https://siem.local/ingest"
            "#,
        )
        .unwrap();
        assert_eq!(hook.timeout(), Duration::from_millis(5000));
    }
}
