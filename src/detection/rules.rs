//! Compiled correlation rules

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::config::{ConfigError, PredicateConfig, RuleConfig};
use crate::models::LogEvent;

/// Derives the grouping key of an event, e.g. its source IP.
///
/// `group_by = "source_ip+user"` builds a composite key; the event has no key
/// (and the rule does not apply) when any of the fields is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExtractor {
    fields: Vec<String>,
}

impl KeyExtractor {
    pub fn parse(group_by: &str) -> Option<Self> {
        let fields: Vec<String> = group_by
            .split('+')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if fields.is_empty() {
            None
        } else {
            Some(KeyExtractor { fields })
        }
    }

    pub fn extract(&self, event: &LogEvent) -> Option<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            parts.push(event.field(field)?);
        }
        Some(parts.join("|"))
    }
}

/// Decides which events count toward a rule
#[derive(Debug, Clone)]
pub struct Predicate {
    message_contains: Vec<String>,
    message_regex: Option<Regex>,
    field_equals: Vec<(String, String)>,
    field_present: Vec<String>,
}

impl Predicate {
    fn compile(config: &PredicateConfig) -> Result<Self, String> {
        let message_regex = match &config.message_regex {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| format!("invalid regex: {}", e))?),
            None => None,
        };

        let predicate = Predicate {
            message_contains: config
                .message_contains
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_lowercase())
                .collect(),
            message_regex,
            field_equals: config
                .field_equals
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            field_present: config.field_present.clone(),
        };

        if predicate.is_empty() {
            return Err("predicate has no conditions".to_string());
        }
        Ok(predicate)
    }

    fn is_empty(&self) -> bool {
        self.message_contains.is_empty()
            && self.message_regex.is_none()
            && self.field_equals.is_empty()
            && self.field_present.is_empty()
    }

    /// Missing fields make the predicate false; evaluation never fails.
    pub fn matches(&self, event: &LogEvent) -> bool {
        if !self.message_contains.is_empty() {
            let message = event.message().to_lowercase();
            if !self.message_contains.iter().any(|needle| message.contains(needle)) {
                return false;
            }
        }

        if let Some(ref regex) = self.message_regex {
            if !regex.is_match(event.message()) {
                return false;
            }
        }

        let fields_equal = self.field_equals.iter().all(|(name, expected)| {
            event
                .field(name)
                .map(|value| value.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
        });

        fields_equal && self.field_present.iter().all(|name| event.field(name).is_some())
    }
}

/// A threshold-within-window rule, immutable for the duration of a run
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub name: Arc<str>,
    pub key_extractor: KeyExtractor,
    pub predicate: Predicate,
    pub threshold: usize,
    pub window: Duration,
    pub cooldown: Duration,
}

impl RuleSpec {
    /// Compile one rule from configuration
    pub fn compile(config: &RuleConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            rule: config.name.clone(),
            reason,
        };

        if config.name.trim().is_empty() {
            return Err(invalid("rule name is empty".to_string()));
        }
        if config.threshold == 0 {
            return Err(invalid("threshold must be at least 1".to_string()));
        }
        if config.window_seconds == 0 {
            return Err(invalid("window_seconds must be positive".to_string()));
        }
        let key_extractor = KeyExtractor::parse(&config.group_by)
            .ok_or_else(|| invalid("group_by names no field".to_string()))?;
        let predicate = Predicate::compile(&config.when).map_err(invalid)?;

        Ok(RuleSpec {
            name: Arc::from(config.name.trim()),
            key_extractor,
            predicate,
            threshold: config.threshold,
            window: Duration::from_secs(config.window_seconds),
            cooldown: Duration::from_secs(config.cooldown_seconds),
        })
    }

    /// Compile a rule set, rejecting duplicate names
    pub fn compile_all(configs: &[RuleConfig]) -> Result<Vec<Self>, ConfigError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(configs.len());

        for config in configs {
            let rule = Self::compile(config)?;
            if !seen.insert(rule.name.clone()) {
                return Err(ConfigError::InvalidRule {
                    rule: config.name.clone(),
                    reason: "duplicate rule name".to_string(),
                });
            }
            rules.push(rule);
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn create_event(message: &str, fields: &[(&str, &str)]) -> LogEvent {
        let mut parsed: BTreeMap<String, String> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        parsed.insert("message".to_string(), message.to_string());
        LogEvent {
            id: "id".to_string(),
            timestamp: Utc::now(),
            source: "test".to_string(),
            raw_text: message.to_string(),
            parsed_fields: parsed,
            parse_ok: true,
            extractor: None,
        }
    }

    fn rule_config(when: PredicateConfig) -> RuleConfig {
        RuleConfig {
            name: "test_rule".to_string(),
            group_by: "source_ip".to_string(),
            threshold: 3,
            window_seconds: 60,
            cooldown_seconds: 300,
            when,
        }
    }

    #[test]
    fn test_message_contains_is_case_insensitive() {
        let rule = RuleSpec::compile(&rule_config(PredicateConfig {
            message_contains: vec!["Failed".to_string()],
            ..PredicateConfig::default()
        }))
        .unwrap();

        assert!(rule.predicate.matches(&create_event("password FAILED for admin", &[])));
        assert!(!rule.predicate.matches(&create_event("Accepted password for admin", &[])));
    }

    #[test]
    fn test_field_conditions() {
        let mut equals = BTreeMap::new();
        equals.insert("outcome".to_string(), "failure".to_string());
        let rule = RuleSpec::compile(&rule_config(PredicateConfig {
            field_equals: equals,
            field_present: vec!["user".to_string()],
            ..PredicateConfig::default()
        }))
        .unwrap();

        assert!(rule
            .predicate
            .matches(&create_event("x", &[("outcome", "Failure"), ("user", "root")])));
        // Missing field is simply non-matching
        assert!(!rule.predicate.matches(&create_event("x", &[("outcome", "failure")])));
        assert!(!rule.predicate.matches(&create_event("x", &[("user", "root")])));
    }

    #[test]
    fn test_regex_condition() {
        let rule = RuleSpec::compile(&rule_config(PredicateConfig {
            message_regex: Some(r"sudo: .* COMMAND=/bin/(ba)?sh".to_string()),
            ..PredicateConfig::default()
        }))
        .unwrap();
        assert!(rule
            .predicate
            .matches(&create_event("sudo: eve : TTY=pts/0 ; COMMAND=/bin/bash", &[])));
        assert!(!rule.predicate.matches(&create_event("sudo: eve : COMMAND=/usr/bin/ls", &[])));
    }

    #[test]
    fn test_composite_key() {
        let extractor = KeyExtractor::parse("source_ip + user").unwrap();
        let event = create_event("x", &[("source_ip", "10.0.0.1"), ("user", "root")]);
        assert_eq!(extractor.extract(&event).as_deref(), Some("10.0.0.1|root"));

        let partial = create_event("x", &[("source_ip", "10.0.0.1")]);
        assert_eq!(extractor.extract(&partial), None);
        assert!(KeyExtractor::parse(" + ").is_none());
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        let mut config = rule_config(PredicateConfig::default());
        assert!(RuleSpec::compile(&config).is_err(), "empty predicate");

        config.when.message_contains = vec!["failed".to_string()];
        config.window_seconds = 0;
        assert!(RuleSpec::compile(&config).is_err(), "zero window");

        config.window_seconds = 60;
        config.group_by = String::new();
        assert!(RuleSpec::compile(&config).is_err(), "no key");

        config.group_by = "source_ip".to_string();
        config.when.message_regex = Some("(".to_string());
        assert!(RuleSpec::compile(&config).is_err(), "bad regex");
    }

    #[test]
    fn test_duplicate_rule_names() {
        let config = rule_config(PredicateConfig {
            message_contains: vec!["failed".to_string()],
            ..PredicateConfig::default()
        });
        let result = RuleSpec::compile_all(&[config.clone(), config]);
        assert!(matches!(result, Err(ConfigError::InvalidRule { reason, .. }) if reason.contains("duplicate")));
    }
}
