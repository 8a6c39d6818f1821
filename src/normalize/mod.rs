//! Log line normalization
//!
//! Turns raw collector lines into [`LogEvent`]s. Extractors are tried in
//! priority order and the first one that recognizes the line decides the
//! parsed fields. A line nobody recognizes still becomes an event, flagged
//! with `parse_ok == false`.

pub mod extractors;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::{ConfigError, NormalizerConfig};
use crate::models::{LogEvent, RawLine};

pub use extractors::{
    ClfExtractor, JsonExtractor, LeadingIpExtractor, PatternExtractor, SshdExtractor,
    SyslogExtractor,
};

/// Fields recovered from one line by an extractor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub fields: BTreeMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Extraction {
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() && value != "-" {
            self.fields.insert(name.to_string(), value);
        }
    }
}

/// A single line format recognizer
pub trait FieldExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Return the extracted fields, or `None` if the line is not in this format
    fn extract(&self, line: &str, received_at: DateTime<Utc>) -> Option<Extraction>;
}

/// Prioritized set of field extractors
pub struct Normalizer {
    extractors: Vec<Box<dyn FieldExtractor>>,
}

impl Normalizer {
    /// Create a normalizer with only the built-in extractors
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_config(&NormalizerConfig::default())
    }

    /// Create a normalizer with the configured custom patterns ahead of the built-ins
    pub fn from_config(config: &NormalizerConfig) -> Result<Self, ConfigError> {
        let mut extractors: Vec<Box<dyn FieldExtractor>> = Vec::new();

        for pattern in &config.patterns {
            let extractor = PatternExtractor::new(&pattern.name, &pattern.regex).map_err(|e| {
                ConfigError::InvalidPattern {
                    name: pattern.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            extractors.push(Box::new(extractor));
        }

        let builtin = |name: &str, e: regex::Error| ConfigError::InvalidPattern {
            name: name.to_string(),
            reason: e.to_string(),
        };
        extractors.push(Box::new(JsonExtractor));
        extractors.push(Box::new(SshdExtractor::new().map_err(|e| builtin("sshd", e))?));
        extractors.push(Box::new(ClfExtractor::new().map_err(|e| builtin("clf", e))?));
        extractors.push(Box::new(SyslogExtractor::new().map_err(|e| builtin("syslog", e))?));
        extractors.push(Box::new(LeadingIpExtractor));

        Ok(Normalizer { extractors })
    }

    /// Names of the extractors in the order they are tried
    pub fn extractor_names(&self) -> Vec<&str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    /// Normalize one raw line. Never fails: unknown formats yield a degraded event.
    pub fn normalize(&self, raw: &RawLine) -> LogEvent {
        let line = raw.text.trim_end_matches(['\r', '\n']);

        let matched = self
            .extractors
            .iter()
            .find_map(|extractor| extractor.extract(line, raw.received_at).map(|x| (extractor.name(), x)));

        match matched {
            Some((name, extraction)) => {
                let timestamp = extraction.timestamp.unwrap_or(raw.received_at);
                let id = extraction
                    .fields
                    .get("id")
                    .or_else(|| extraction.fields.get("event_id"))
                    .cloned()
                    .unwrap_or_else(|| LogEvent::derive_id(&raw.source, &timestamp, line));

                LogEvent {
                    id,
                    timestamp,
                    source: raw.source.clone(),
                    raw_text: line.to_string(),
                    parsed_fields: extraction.fields,
                    parse_ok: true,
                    extractor: Some(name.to_string()),
                }
            }
            None => {
                log::debug!("No extractor matched line from {}: {:.80}", raw.source, line);
                LogEvent {
                    id: LogEvent::derive_id(&raw.source, &raw.received_at, line),
                    timestamp: raw.received_at,
                    source: raw.source.clone(),
                    raw_text: line.to_string(),
                    parsed_fields: BTreeMap::new(),
                    parse_ok: false,
                    extractor: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternConfig;
    use chrono::{Datelike, TimeZone, Timelike};

    fn raw(text: &str) -> RawLine {
        RawLine::new(text, "auth.log", Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_sshd_failure_line() {
        let normalizer = Normalizer::new().unwrap();
        let event = normalizer.normalize(&raw(
            "Mar  1 11:59:58 bastion sshd[4242]: Failed password for invalid user admin from 203.0.113.7 port 52144 ssh2",
        ));

        assert!(event.parse_ok);
        assert_eq!(event.extractor.as_deref(), Some("sshd"));
        assert_eq!(event.field("user"), Some("admin"));
        assert_eq!(event.field("source_ip"), Some("203.0.113.7"));
        assert_eq!(event.field("outcome"), Some("failure"));
        assert_eq!(event.field("host"), Some("bastion"));
        assert_eq!(event.timestamp.hour(), 11);
        assert_eq!(event.timestamp.second(), 58);
        assert_eq!(event.timestamp.year(), 2024);
    }

    #[test]
    fn test_json_line_with_explicit_id() {
        let normalizer = Normalizer::new().unwrap();
        let event = normalizer.normalize(&raw(
            r#"{"id":"evt-77","timestamp":"2023-01-01T10:00:05","ip":"192.168.1.5","message":"password failed for user admin"}"#,
        ));

        assert_eq!(event.id, "evt-77");
        assert_eq!(event.extractor.as_deref(), Some("json"));
        assert_eq!(event.field("source_ip"), Some("192.168.1.5"));
        assert_eq!(event.message(), "password failed for user admin");
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 5).unwrap());
    }

    #[test]
    fn test_unparseable_line_is_degraded_not_fatal() {
        let normalizer = Normalizer::new().unwrap();
        let line = raw("%%%% garbage \u{1} ####");
        let event = normalizer.normalize(&line);

        assert!(!event.parse_ok);
        assert!(event.parsed_fields.is_empty());
        assert!(event.extractor.is_none());
        assert_eq!(event.timestamp, line.received_at);
        assert_eq!(event.raw_text, "%%%% garbage \u{1} ####");
    }

    #[test]
    fn test_same_line_same_id() {
        let normalizer = Normalizer::new().unwrap();
        let line = raw("Mar  1 11:59:58 bastion sshd[4242]: Failed password for root from 10.0.0.9 port 22 ssh2");
        assert_eq!(normalizer.normalize(&line).id, normalizer.normalize(&line).id);
    }

    #[test]
    fn test_custom_pattern_takes_priority() {
        let config = NormalizerConfig {
            patterns: vec![PatternConfig {
                name: "vpn".to_string(),
                regex: r"^VPN (?P<outcome>\w+) user=(?P<user>\S+) ip=(?P<source_ip>\S+)$".to_string(),
            }],
        };
        let normalizer = Normalizer::from_config(&config).unwrap();
        assert_eq!(normalizer.extractor_names()[0], "vpn");

        let event = normalizer.normalize(&raw("VPN failure user=bob ip=198.51.100.4"));
        assert_eq!(event.extractor.as_deref(), Some("vpn"));
        assert_eq!(event.field("user"), Some("bob"));
        assert_eq!(event.field("source_ip"), Some("198.51.100.4"));
    }

    #[test]
    fn test_invalid_custom_pattern_is_config_error() {
        let config = NormalizerConfig {
            patterns: vec![PatternConfig {
                name: "broken".to_string(),
                regex: r"(?P<user>unclosed".to_string(),
            }],
        };
        assert!(matches!(
            Normalizer::from_config(&config),
            Err(ConfigError::InvalidPattern { name, .. }) if name == "broken"
        ));
    }

    #[test]
    fn test_trailing_newline_is_stripped() {
        let normalizer = Normalizer::new().unwrap();
        let event = normalizer.normalize(&raw("10.1.1.1 GET /admin denied now\n"));
        assert_eq!(event.raw_text, "10.1.1.1 GET /admin denied now");
        assert_eq!(event.extractor.as_deref(), Some("leading_ip"));
    }
}
