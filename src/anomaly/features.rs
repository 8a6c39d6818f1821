//! Feature encoding for anomaly scoring

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{Datelike, Timelike};
use dashmap::DashMap;

use crate::config::ConfigError;
use crate::models::LogEvent;

const RATE_WINDOW_MS: i64 = 60_000;
const ERROR_KEYWORDS: [&str; 4] = ["error", "fail", "exception", "denied"];

/// A single numeric feature derived from an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    HourOfDay,
    DayOfWeek,
    IsWeekend,
    MessageLength,
    WordCount,
    HasErrorKeyword,
    DigitRatio,
    ParseOk,
    FieldCount,
    IsFailure,
    /// Events for the same source IP (or user) over the last minute
    KeyRate1m,
    /// Events from the same source over the last minute
    SourceRate1m,
}

impl Feature {
    pub const ALL: [Feature; 12] = [
        Feature::HourOfDay,
        Feature::DayOfWeek,
        Feature::IsWeekend,
        Feature::MessageLength,
        Feature::WordCount,
        Feature::HasErrorKeyword,
        Feature::DigitRatio,
        Feature::ParseOk,
        Feature::FieldCount,
        Feature::IsFailure,
        Feature::KeyRate1m,
        Feature::SourceRate1m,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Feature::HourOfDay => "hour_of_day",
            Feature::DayOfWeek => "day_of_week",
            Feature::IsWeekend => "is_weekend",
            Feature::MessageLength => "message_length",
            Feature::WordCount => "word_count",
            Feature::HasErrorKeyword => "has_error_keyword",
            Feature::DigitRatio => "digit_ratio",
            Feature::ParseOk => "parse_ok",
            Feature::FieldCount => "field_count",
            Feature::IsFailure => "is_failure",
            Feature::KeyRate1m => "key_rate_1m",
            Feature::SourceRate1m => "source_rate_1m",
        }
    }

    pub fn from_name(name: &str) -> Option<Feature> {
        Feature::ALL.iter().copied().find(|f| f.name() == name)
    }
}

/// Ordered list of features a model was trained on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    features: Arc<[Feature]>,
}

impl FeatureSchema {
    /// The complete built-in schema
    pub fn full() -> Self {
        FeatureSchema {
            features: Arc::from(&Feature::ALL[..]),
        }
    }

    /// Build a schema from configured names; an empty list selects every feature
    pub fn from_names(names: &[String]) -> Result<Self, ConfigError> {
        if names.is_empty() {
            return Ok(Self::full());
        }
        let features = names
            .iter()
            .map(|name| Feature::from_name(name.trim()).ok_or_else(|| ConfigError::UnknownFeature(name.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FeatureSchema {
            features: Arc::from(features),
        })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.features.iter().map(Feature::name).collect()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Values of one event, in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub schema: FeatureSchema,
    pub values: Vec<f64>,
    /// Event time in milliseconds, used to trim the training window
    pub timestamp_ms: i64,
}

/// Derives feature vectors from events.
///
/// The rate features need a little recent history per key and per source,
/// kept in sharded maps and pruned as they are touched.
pub struct FeatureEncoder {
    schema: FeatureSchema,
    key_history: DashMap<String, VecDeque<i64>>,
    source_history: DashMap<String, VecDeque<i64>>,
}

impl FeatureEncoder {
    pub fn new(schema: FeatureSchema) -> Self {
        FeatureEncoder {
            schema,
            key_history: DashMap::new(),
            source_history: DashMap::new(),
        }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Encode an event, recording it in the rate history
    pub fn encode(&self, event: &LogEvent) -> FeatureVector {
        let now = event.timestamp_millis();
        let rate_key = event.field("source_ip").or_else(|| event.field("user"));
        let needs_key_rate = self.schema.features().contains(&Feature::KeyRate1m);
        let needs_source_rate = self.schema.features().contains(&Feature::SourceRate1m);

        let key_rate = match rate_key {
            Some(key) if needs_key_rate => record(&self.key_history, key, now),
            _ => 0,
        };
        let source_rate = if needs_source_rate {
            record(&self.source_history, &event.source, now)
        } else {
            0
        };

        let message = event.message();
        let values = self
            .schema
            .features()
            .iter()
            .map(|feature| match feature {
                Feature::HourOfDay => event.timestamp.hour() as f64,
                Feature::DayOfWeek => event.timestamp.weekday().num_days_from_monday() as f64,
                Feature::IsWeekend => flag(event.timestamp.weekday().num_days_from_monday() >= 5),
                Feature::MessageLength => message.chars().count() as f64,
                Feature::WordCount => message.split_whitespace().count() as f64,
                Feature::HasErrorKeyword => {
                    let lower = message.to_lowercase();
                    flag(ERROR_KEYWORDS.iter().any(|k| lower.contains(k)))
                }
                Feature::DigitRatio => digit_ratio(&event.raw_text),
                Feature::ParseOk => flag(event.parse_ok),
                Feature::FieldCount => event.parsed_fields.len() as f64,
                Feature::IsFailure => flag(event.field("outcome") == Some("failure")),
                Feature::KeyRate1m => key_rate as f64,
                Feature::SourceRate1m => source_rate as f64,
            })
            .collect();

        FeatureVector {
            schema: self.schema.clone(),
            values,
            timestamp_ms: now,
        }
    }

    /// Drop rate history with no entry inside the trailing minute
    pub fn prune_stale(&self, now_ms: i64) {
        let cutoff = now_ms - RATE_WINDOW_MS;
        for history in [&self.key_history, &self.source_history] {
            history.retain(|_, timestamps| {
                timestamps.back().map_or(false, |&newest| newest > cutoff)
            });
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.key_history.len() + self.source_history.len()
    }
}

/// Record a timestamp for `key` and return the number of entries within the rate window
fn record(history: &DashMap<String, VecDeque<i64>>, key: &str, now: i64) -> usize {
    let mut timestamps = history.entry(key.to_string()).or_default();
    let position = timestamps.partition_point(|&t| t <= now);
    timestamps.insert(position, now);

    let newest = timestamps.back().copied().unwrap_or(now);
    let cutoff = newest - RATE_WINDOW_MS;
    while timestamps.front().map_or(false, |&t| t <= cutoff) {
        timestamps.pop_front();
    }
    timestamps.iter().filter(|&&t| t > now - RATE_WINDOW_MS && t <= now).count()
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn digit_ratio(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    digits as f64 / total as f64
}
