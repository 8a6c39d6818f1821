use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One line as handed over by a log collector, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLine {
    pub text: String,
    /// Originating host, file or listener
    pub source: String,
    /// Ingestion time, used when the line carries no timestamp of its own
    pub received_at: DateTime<Utc>,
}

impl RawLine {
    pub fn new(text: impl Into<String>, source: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        RawLine {
            text: text.into(),
            source: source.into(),
            received_at,
        }
    }

    /// Create a raw line stamped with the current time
    pub fn now(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(text, source, Utc::now())
    }
}

/// A normalized log event.
///
/// Events are created once by the normalizer and never mutated afterwards.
/// When parsing fails the event still exists with `parse_ok == false` and an
/// empty field map, so lexical features can still be derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Stable identifier, used as the deduplication key
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub raw_text: String,
    pub parsed_fields: BTreeMap<String, String>,
    pub parse_ok: bool,
    /// Name of the extractor that produced `parsed_fields`
    pub extractor: Option<String>,
}

impl LogEvent {
    /// Look up a parsed field. `source` falls back to the event source.
    pub fn field(&self, name: &str) -> Option<&str> {
        match self.parsed_fields.get(name) {
            Some(value) => Some(value.as_str()),
            None if name == "source" => Some(self.source.as_str()),
            None => None,
        }
    }

    /// The free-text message of the event, or the raw line if none was parsed
    pub fn message(&self) -> &str {
        self.parsed_fields
            .get("message")
            .map(String::as_str)
            .unwrap_or(&self.raw_text)
    }

    /// Event time in milliseconds since the Unix epoch
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Derive a content-based id so that a redelivered line maps to the same event.
    pub fn derive_id(source: &str, timestamp: &DateTime<Utc>, raw_text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(timestamp.timestamp_millis().to_be_bytes());
        hasher.update([0u8]);
        hasher.update(raw_text.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_with_fields(fields: &[(&str, &str)]) -> LogEvent {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        LogEvent {
            id: "evt-1".to_string(),
            timestamp,
            source: "auth.log".to_string(),
            raw_text: "raw line".to_string(),
            parsed_fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            parse_ok: !fields.is_empty(),
            extractor: None,
        }
    }

    #[test]
    fn test_derive_id_is_stable() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let a = LogEvent::derive_id("auth.log", &ts, "Failed password for root");
        let b = LogEvent::derive_id("auth.log", &ts, "Failed password for root");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_derive_id_differs_by_source() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let a = LogEvent::derive_id("host-a", &ts, "same text");
        let b = LogEvent::derive_id("host-b", &ts, "same text");
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_falls_back_to_raw_text() {
        let event = event_with_fields(&[]);
        assert_eq!(event.message(), "raw line");

        let event = event_with_fields(&[("message", "parsed message")]);
        assert_eq!(event.message(), "parsed message");
    }

    #[test]
    fn test_source_field_fallback() {
        let event = event_with_fields(&[("user", "alice")]);
        assert_eq!(event.field("user"), Some("alice"));
        assert_eq!(event.field("source"), Some("auth.log"));
        assert_eq!(event.field("source_ip"), None);
    }
}
