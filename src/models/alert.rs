use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LogEvent;

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parse a severity label, accepting a few common synonyms
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" | "info" => Some(Severity::Low),
            "medium" | "warning" | "warn" => Some(Severity::Medium),
            "high" | "error" => Some(Severity::High),
            "critical" | "crit" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Severity used when no enrichment is available: any fired rule is high,
    /// an anomaly on its own is medium.
    pub fn fallback(rule_hits: &BTreeSet<String>, anomalous: bool) -> Self {
        if !rule_hits.is_empty() {
            Severity::High
        } else if anomalous {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Explanation attached to an alert by an enrichment provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub explanation: String,
    /// Provider confidence in `[0, 1]`
    pub confidence: f64,
    /// Id of the provider that produced the explanation
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

/// A security alert produced for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub event_id: String,
    pub source: String,
    pub event_timestamp: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
    pub rule_hits: BTreeSet<String>,
    pub anomaly_score: Option<f64>,
    pub enrichment: Option<Enrichment>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Assemble an alert for `event`.
    ///
    /// Returns `None` when neither a rule hit nor an anomaly score is present:
    /// an alert always carries at least one detection signal.
    pub fn new(
        event: &LogEvent,
        severity: Severity,
        rule_hits: BTreeSet<String>,
        anomaly_score: Option<f64>,
        enrichment: Option<Enrichment>,
    ) -> Option<Self> {
        if rule_hits.is_empty() && anomaly_score.is_none() {
            return None;
        }

        Some(Alert {
            event_id: event.id.clone(),
            source: event.source.clone(),
            event_timestamp: event.timestamp,
            message: event.raw_text.clone(),
            severity,
            rule_hits,
            anomaly_score,
            enrichment,
            created_at: Utc::now(),
        })
    }

    /// Comma separated rule names, or `-` when only the anomaly signal fired
    pub fn rule_summary(&self) -> String {
        if self.rule_hits.is_empty() {
            "-".to_string()
        } else {
            self.rule_hits.iter().cloned().collect::<Vec<_>>().join(",")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn create_event() -> LogEvent {
        LogEvent {
            id: "abc".to_string(),
            timestamp: Utc::now(),
            source: "auth.log".to_string(),
            raw_text: "Failed password for root from 10.0.0.1 port 22 ssh2".to_string(),
            parsed_fields: BTreeMap::new(),
            parse_ok: false,
            extractor: None,
        }
    }

    #[test]
    fn test_alert_requires_a_signal() {
        let event = create_event();
        assert!(Alert::new(&event, Severity::Low, BTreeSet::new(), None, None).is_none());

        let alert = Alert::new(&event, Severity::Medium, BTreeSet::new(), Some(0.82), None).unwrap();
        assert_eq!(alert.event_id, "abc");
        assert_eq!(alert.rule_summary(), "-");

        let hits: BTreeSet<String> = ["brute_force".to_string()].into_iter().collect();
        let alert = Alert::new(&event, Severity::High, hits, None, None).unwrap();
        assert_eq!(alert.rule_summary(), "brute_force");
    }

    #[test]
    fn test_fallback_severity() {
        let hits: BTreeSet<String> = ["brute_force".to_string()].into_iter().collect();
        assert_eq!(Severity::fallback(&hits, false), Severity::High);
        assert_eq!(Severity::fallback(&hits, true), Severity::High);
        assert_eq!(Severity::fallback(&BTreeSet::new(), true), Severity::Medium);
        assert_eq!(Severity::fallback(&BTreeSet::new(), false), Severity::Low);
    }

    #[test]
    fn test_severity_parse_and_order() {
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("warning"), Some(Severity::Medium));
        assert_eq!(Severity::parse("bogus"), None);
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_alert_serializes_snake_case_severity() {
        let event = create_event();
        let alert = Alert::new(&event, Severity::High, BTreeSet::new(), Some(0.9), None).unwrap();
        let json = serde_json::to_string(&alert).unwrap();
        assert!(json.contains("\"severity\":\"high\""));
        assert!(json.contains("\"enrichment\":null"));
    }
}
