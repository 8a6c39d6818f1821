//! Local keyword-based explanation provider

use async_trait::async_trait;

use crate::enrichment::{DetectionContext, EnrichmentError, EnrichmentProvider, Explanation};
use crate::models::Severity;

const SUMMARY_LEN: usize = 100;

/// Keyword tiers, checked from most to least severe
const SEVERITY_KEYWORDS: [(Severity, &[&str]); 4] = [
    (
        Severity::Critical,
        &["critical", "fatal", "panic", "crash", "segmentation fault"],
    ),
    (
        Severity::High,
        &["error", "fail", "denied", "blocked", "attack", "exception", "unauthorized"],
    ),
    (
        Severity::Medium,
        &["warning", "unusual", "suspicious", "timeout", "refused", "non-fatal"],
    ),
    (
        Severity::Low,
        &["info", "debug", "normal", "success", "accepted", "connected"],
    ),
];

/// Explains alerts from the message text alone, without any remote call
#[derive(Debug, Clone, Default)]
pub struct HeuristicProvider;

impl HeuristicProvider {
    pub fn new() -> Self {
        HeuristicProvider
    }

    /// First keyword tier that matches the message
    pub fn keyword_severity(message: &str) -> Option<Severity> {
        let lower = message.to_lowercase();
        SEVERITY_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(severity, _)| *severity)
    }

    /// Security-relevant tokens: IP addresses, file paths and user names
    pub fn extract_entities(text: &str) -> Vec<String> {
        text.split_whitespace()
            .filter_map(|word| {
                let word = word.trim_matches(|c: char| c == ',' || c == ';' || c == '"' || c == '\'');
                if is_ip_like(word) {
                    Some(format!("IP:{}", word))
                } else if word.contains('/') || word.contains('\\') {
                    Some(format!("FILE:{}", word))
                } else if word.starts_with("user:") || word.to_lowercase().contains("username") {
                    Some(format!("USER:{}", word))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn summarize(message: &str) -> String {
        if message.chars().count() > SUMMARY_LEN {
            let head: String = message.chars().take(SUMMARY_LEN - 3).collect();
            format!("{}...", head)
        } else {
            message.to_string()
        }
    }

    pub fn recommend(message: &str, severity: Severity) -> &'static str {
        let lower = message.to_lowercase();
        if ["denied", "blocked", "unauthorized"].iter().any(|k| lower.contains(k)) {
            "Investigate potential unauthorized access attempt. Check source IP and user."
        } else if ["error", "fail", "exception"].iter().any(|k| lower.contains(k)) {
            "Check system health and application logs for root cause of this error."
        } else if severity == Severity::Critical {
            "Immediate investigation required - potential system crash or security incident."
        } else {
            "Monitor for similar patterns and investigate if recurring."
        }
    }

    fn analyze(&self, context: &DetectionContext) -> Explanation {
        let event = &context.event;
        let message = event.message();
        let keyword_severity = Self::keyword_severity(message);

        let mut severity = keyword_severity.unwrap_or(Severity::Low);
        if !context.rule_hits.is_empty() {
            severity = severity.max(Severity::High);
        }
        if context.is_anomalous() {
            severity = severity.max(Severity::Medium);
        }

        let mut parts = vec![Self::summarize(message)];
        if !context.rule_hits.is_empty() {
            let rules: Vec<&str> = context.rule_hits.iter().map(String::as_str).collect();
            parts.push(format!("Rules fired: {}", rules.join(", ")));
        }
        if let Some(score) = context.anomaly_score {
            parts.push(format!(
                "Anomaly score {:.2} (threshold {:.2})",
                score.value, score.threshold
            ));
        }
        let mut entities = Self::extract_entities(&event.raw_text);
        if let Some(user) = event.field("user") {
            let user_entity = format!("USER:{}", user);
            if !entities.contains(&user_entity) {
                entities.push(user_entity);
            }
        }
        if !entities.is_empty() {
            parts.push(format!("Entities: {}", entities.join(", ")));
        }

        let mut confidence: f64 = if keyword_severity.is_some() { 0.6 } else { 0.4 };
        if !context.rule_hits.is_empty() {
            confidence += 0.2;
        }
        if context.is_anomalous() {
            confidence += 0.1;
        }

        Explanation {
            severity,
            explanation: parts.join(". "),
            confidence: confidence.min(0.95),
            recommendation: Some(Self::recommend(message, severity).to_string()),
        }
    }
}

fn is_ip_like(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| !p.is_empty() && p.parse::<u8>().is_ok())
}

#[async_trait]
impl EnrichmentProvider for HeuristicProvider {
    fn id(&self) -> &str {
        "heuristic"
    }

    async fn explain(&self, context: &DetectionContext) -> Result<Explanation, EnrichmentError> {
        Ok(self.analyze(context))
    }
}
