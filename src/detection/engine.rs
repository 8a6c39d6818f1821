//! Rule evaluation over per-key sliding windows
//!
//! Window state is sharded by (rule, key) in a [`DashMap`], so events for
//! different keys are evaluated concurrently while updates to one key are
//! serialized by the shard lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::{Config, ConfigError, DetectionConfig};
use crate::detection::rules::RuleSpec;
use crate::detection::window::{Observation, WindowLimits, WindowState};
use crate::models::LogEvent;

type StateKey = (Arc<str>, String);

/// Evaluates correlation rules against normalized events
pub struct RuleEngine {
    rules: Vec<RuleSpec>,
    states: DashMap<StateKey, WindowState>,
    tolerance_ms: i64,
    idle_expiry_ms: i64,
}

impl RuleEngine {
    pub fn new(rules: Vec<RuleSpec>, config: &DetectionConfig) -> Self {
        // Never drop state that a window or cooldown still needs
        let longest_rule_span = rules
            .iter()
            .map(|r| r.window.max(r.cooldown))
            .max()
            .unwrap_or_default();
        let idle_expiry = config.idle_expiry().max(longest_rule_span);

        RuleEngine {
            rules,
            states: DashMap::new(),
            tolerance_ms: config.max_out_of_order().as_millis() as i64,
            idle_expiry_ms: idle_expiry.as_millis() as i64,
        }
    }

    /// Compile the configured rules and build an engine
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let rules = RuleSpec::compile_all(&config.rules)?;
        Ok(Self::new(rules, &config.detection))
    }

    pub fn rules(&self) -> &[RuleSpec] {
        &self.rules
    }

    fn limits(&self, rule: &RuleSpec) -> WindowLimits {
        WindowLimits {
            threshold: rule.threshold,
            window_ms: rule.window.as_millis() as i64,
            cooldown_ms: rule.cooldown.as_millis() as i64,
            tolerance_ms: self.tolerance_ms,
        }
    }

    /// Record the event against every matching rule and return the names of
    /// the rules that fired for it.
    pub fn evaluate(&self, event: &LogEvent) -> BTreeSet<String> {
        let mut fired = BTreeSet::new();
        let timestamp = event.timestamp_millis();

        for rule in &self.rules {
            if !rule.predicate.matches(event) {
                continue;
            }
            let Some(key) = rule.key_extractor.extract(event) else {
                continue;
            };

            let limits = self.limits(rule);
            let observation = self
                .states
                .entry((rule.name.clone(), key.clone()))
                .or_default()
                .observe(timestamp, &limits);

            match observation {
                Observation::Counted { count, fired: true } => {
                    log::info!(
                        "Rule '{}' fired for key '{}' ({} events in {}s)",
                        rule.name,
                        key,
                        count,
                        rule.window.as_secs()
                    );
                    fired.insert(rule.name.to_string());
                }
                Observation::Counted { .. } => {}
                Observation::Late => {
                    log::debug!(
                        "Event {} for rule '{}' key '{}' arrived too far out of order",
                        event.id,
                        rule.name,
                        key
                    );
                }
            }
        }

        fired
    }

    /// Current number of events in the window of one (rule, key) pair
    pub fn window_count(&self, rule: &str, key: &str) -> usize {
        let state_key: StateKey = (Arc::from(rule), key.to_string());
        self.states
            .get(&state_key)
            .map(|state| state.count())
            .unwrap_or(0)
    }

    /// Number of (rule, key) pairs currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.states.len()
    }

    /// Drop state for pairs idle longer than the expiry; returns how many were dropped
    pub fn prune_stale(&self, now_ms: i64) -> usize {
        let before = self.states.len();
        self.states
            .retain(|_, state| !state.is_idle(now_ms, self.idle_expiry_ms));
        let removed = before.saturating_sub(self.states.len());
        if removed > 0 {
            log::debug!("Pruned {} idle rule windows", removed);
        }
        removed
    }

    pub fn clear_all(&self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PredicateConfig, RuleConfig};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    const BASE: i64 = 1_700_000_000;

    fn create_event(ip: &str, seconds: i64, message: &str) -> LogEvent {
        let timestamp = Utc.timestamp_opt(BASE + seconds, 0).unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("source_ip".to_string(), ip.to_string());
        fields.insert("message".to_string(), message.to_string());
        LogEvent {
            id: format!("{}-{}", ip, seconds),
            timestamp,
            source: "test".to_string(),
            raw_text: message.to_string(),
            parsed_fields: fields,
            parse_ok: true,
            extractor: Some("test".to_string()),
        }
    }

    fn brute_force_engine(threshold: usize, window: u64, cooldown: u64) -> RuleEngine {
        let config = RuleConfig {
            name: "brute_force".to_string(),
            group_by: "source_ip".to_string(),
            threshold,
            window_seconds: window,
            cooldown_seconds: cooldown,
            when: PredicateConfig {
                message_contains: vec!["failed".to_string()],
                ..PredicateConfig::default()
            },
        };
        let rules = RuleSpec::compile_all(&[config]).unwrap();
        RuleEngine::new(rules, &DetectionConfig::default())
    }

    #[test]
    fn test_five_failures_fire_exactly_once() {
        let engine = brute_force_engine(3, 60, 300);

        let fired: Vec<usize> = (0..5)
            .map(|i| engine.evaluate(&create_event("10.0.0.5", i * 6, "Failed password")).len())
            .collect();

        assert_eq!(fired, vec![0, 0, 1, 0, 0]);
        assert_eq!(engine.window_count("brute_force", "10.0.0.5"), 5);
    }

    #[test]
    fn test_non_matching_events_are_ignored() {
        let engine = brute_force_engine(1, 60, 0);
        assert!(engine.evaluate(&create_event("10.0.0.5", 0, "Accepted password")).is_empty());
        assert_eq!(engine.tracked_keys(), 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let engine = brute_force_engine(2, 60, 300);

        assert!(engine.evaluate(&create_event("10.0.0.1", 0, "failed")).is_empty());
        assert!(engine.evaluate(&create_event("10.0.0.2", 1, "failed")).is_empty());
        assert!(engine.evaluate(&create_event("10.0.0.1", 2, "failed")).contains("brute_force"));
        assert!(engine.evaluate(&create_event("10.0.0.2", 3, "failed")).contains("brute_force"));
    }

    #[test]
    fn test_refires_after_cooldown() {
        let engine = brute_force_engine(3, 600, 300);
        let mut fired_at = Vec::new();

        for i in 0..20 {
            let seconds = i * 30;
            if !engine.evaluate(&create_event("10.0.0.5", seconds, "failed")).is_empty() {
                fired_at.push(seconds);
            }
        }
        assert_eq!(fired_at, vec![60, 360]);
    }

    #[test]
    fn test_rearms_after_burst_lapses() {
        let engine = brute_force_engine(3, 60, 3600);

        for i in 0..3 {
            engine.evaluate(&create_event("10.0.0.5", i, "failed"));
        }
        // Second burst well after the window but inside the cooldown
        let mut second = Vec::new();
        for i in 0..3 {
            second.push(engine.evaluate(&create_event("10.0.0.5", 600 + i, "failed")).len());
        }
        assert_eq!(second, vec![0, 0, 1]);
    }

    #[test]
    fn test_concurrent_keys() {
        let engine = Arc::new(brute_force_engine(10, 60, 300));
        let fired = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let engine = engine.clone();
                let fired = &fired;
                scope.spawn(move || {
                    let ip = format!("10.1.0.{}", worker);
                    for i in 0..25 {
                        let hits = engine.evaluate(&create_event(&ip, i, "failed"));
                        fired.fetch_add(hits.len(), std::sync::atomic::Ordering::Relaxed);
                    }
                });
            }
        });

        // One firing per key regardless of interleaving
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 8);
        assert_eq!(engine.tracked_keys(), 8);
        for worker in 0..8 {
            assert_eq!(engine.window_count("brute_force", &format!("10.1.0.{}", worker)), 25);
        }
    }

    #[test]
    fn test_prune_stale_drops_idle_keys() {
        let engine = brute_force_engine(3, 60, 300);
        engine.evaluate(&create_event("10.0.0.1", 0, "failed"));
        engine.evaluate(&create_event("10.0.0.2", 4000, "failed"));

        let now_ms = (BASE + 4000) * 1000;
        assert_eq!(engine.prune_stale(now_ms), 1);
        assert_eq!(engine.tracked_keys(), 1);
        assert_eq!(engine.window_count("brute_force", "10.0.0.1"), 0);

        engine.clear_all();
        assert_eq!(engine.tracked_keys(), 0);
    }
}
