//! Built-in line format extractors

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use super::{Extraction, FieldExtractor};

/// Parse the timestamp formats commonly found in structured logs
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    // Epoch seconds or milliseconds
    if let Ok(number) = value.parse::<i64>() {
        return if number > 100_000_000_000 {
            Utc.timestamp_millis_opt(number).single()
        } else {
            Utc.timestamp_opt(number, 0).single()
        };
    }
    None
}

/// Parse a year-less syslog timestamp such as `Mar  1 11:59:58`.
///
/// The year is taken from the ingestion time; a result more than a day in the
/// future is assumed to belong to the previous year.
fn parse_syslog_timestamp(value: &str, received_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let compact = value.split_whitespace().collect::<Vec<_>>().join(" ");
    let with_year = format!("{} {}", received_at.year(), compact);
    let naive = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S").ok()?;
    let parsed = Utc.from_utc_datetime(&naive);

    if parsed > received_at + Duration::days(1) {
        let previous = naive.with_year(received_at.year() - 1)?;
        return Some(Utc.from_utc_datetime(&previous));
    }
    Some(parsed)
}

fn is_ip(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}

/// Canonical field name for common JSON aliases
fn canonical_field(name: &str) -> &str {
    match name {
        "ip" | "src_ip" | "client_ip" | "remote_addr" | "rhost" => "source_ip",
        "username" | "user_name" | "account" => "user",
        "msg" => "message",
        "@timestamp" | "time" | "ts" => "timestamp",
        "hostname" => "host",
        other => other,
    }
}

// ============================================
// JSON lines
// ============================================

/// Structured JSON object lines
pub struct JsonExtractor;

impl FieldExtractor for JsonExtractor {
    fn name(&self) -> &str {
        "json"
    }

    fn extract(&self, line: &str, _received_at: DateTime<Utc>) -> Option<Extraction> {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('{') {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let object = value.as_object()?;

        let mut extraction = Extraction::default();
        for (key, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            extraction.insert(canonical_field(key), text);
        }

        extraction.timestamp = extraction
            .fields
            .get("timestamp")
            .and_then(|ts| parse_timestamp(ts));
        Some(extraction)
    }
}

// ============================================
// Syslog header shared by sshd and generic syslog
// ============================================

struct SyslogHeader {
    pattern: Regex,
}

impl SyslogHeader {
    fn new() -> Result<Self, regex::Error> {
        Ok(SyslogHeader {
            pattern: Regex::new(
                r"^(?:<(?P<pri>\d{1,3})>)?(?P<ts>[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(?P<host>\S+)\s+(?P<program>[^\s:\[]+)(?:\[(?P<pid>\d+)\])?:\s*(?P<message>.*)$",
            )?,
        })
    }

    /// Fill host/program/pid/message/timestamp from the header, if present
    fn apply(&self, line: &str, received_at: DateTime<Utc>, extraction: &mut Extraction) -> bool {
        let caps = match self.pattern.captures(line) {
            Some(caps) => caps,
            None => return false,
        };
        for name in ["host", "program", "pid", "message"] {
            if let Some(m) = caps.name(name) {
                extraction.insert(name, m.as_str());
            }
        }
        extraction.timestamp = caps
            .name("ts")
            .and_then(|m| parse_syslog_timestamp(m.as_str(), received_at));
        true
    }
}

// ============================================
// OpenSSH / PAM authentication
// ============================================

/// OpenSSH and PAM authentication messages, with or without a syslog header
pub struct SshdExtractor {
    header: SyslogHeader,
    patterns: Vec<(Regex, &'static str)>,
}

impl SshdExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        let patterns = vec![
            (
                Regex::new(r"Failed (?P<method>\S+) for (?:invalid user )?(?P<user>\S+) from (?P<ip>[0-9A-Fa-f:.]+) port (?P<port>\d+)")?,
                "failure",
            ),
            (
                Regex::new(r"Accepted (?P<method>\S+) for (?P<user>\S+) from (?P<ip>[0-9A-Fa-f:.]+) port (?P<port>\d+)")?,
                "success",
            ),
            (
                Regex::new(r"Invalid user (?P<user>\S*) from (?P<ip>[0-9A-Fa-f:.]+)")?,
                "failure",
            ),
            (
                Regex::new(r"authentication failure;.*?rhost=(?P<ip>\S*)(?:\s+user=(?P<user>\S+))?")?,
                "failure",
            ),
        ];
        Ok(SshdExtractor {
            header: SyslogHeader::new()?,
            patterns,
        })
    }
}

impl FieldExtractor for SshdExtractor {
    fn name(&self) -> &str {
        "sshd"
    }

    fn extract(&self, line: &str, received_at: DateTime<Utc>) -> Option<Extraction> {
        let (caps, outcome) = self
            .patterns
            .iter()
            .find_map(|(pattern, outcome)| pattern.captures(line).map(|caps| (caps, *outcome)))?;

        let mut extraction = Extraction::default();
        self.header.apply(line, received_at, &mut extraction);

        if let Some(user) = caps.name("user") {
            extraction.insert("user", user.as_str());
        }
        if let Some(ip) = caps.name("ip").filter(|m| is_ip(m.as_str())) {
            extraction.insert("source_ip", ip.as_str());
        }
        if let Some(port) = caps.name("port") {
            extraction.insert("port", port.as_str());
        }
        if let Some(method) = caps.name("method") {
            extraction.insert("auth_method", method.as_str());
        }
        extraction.insert("action", "authentication");
        extraction.insert("outcome", outcome);
        Some(extraction)
    }
}

// ============================================
// Apache / Nginx common log format
// ============================================

/// Web server access logs in common/combined log format
pub struct ClfExtractor {
    pattern: Regex,
}

impl ClfExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(ClfExtractor {
            pattern: Regex::new(
                r#"^(?P<ip>\S+) \S+ (?P<user>\S+) \[(?P<ts>[^\]]+)\] "(?P<method>[A-Z]+) (?P<path>\S+)[^"]*" (?P<status>\d{3}) (?:\d+|-)"#,
            )?,
        })
    }
}

impl FieldExtractor for ClfExtractor {
    fn name(&self) -> &str {
        "clf"
    }

    fn extract(&self, line: &str, _received_at: DateTime<Utc>) -> Option<Extraction> {
        let caps = self.pattern.captures(line)?;
        let ip = caps.name("ip")?.as_str();
        if !is_ip(ip) {
            return None;
        }

        let mut extraction = Extraction::default();
        extraction.insert("source_ip", ip);
        extraction.insert("user", caps.name("user").map_or("", |m| m.as_str()));
        extraction.insert("method", caps.name("method").map_or("", |m| m.as_str()));
        extraction.insert("path", caps.name("path").map_or("", |m| m.as_str()));
        extraction.insert("action", "http_request");

        if let Some(status) = caps.name("status") {
            let code: u16 = status.as_str().parse().unwrap_or(0);
            extraction.insert("status", status.as_str());
            extraction.insert("outcome", if code >= 400 { "failure" } else { "success" });
        }
        extraction.timestamp = caps
            .name("ts")
            .and_then(|m| DateTime::parse_from_str(m.as_str(), "%d/%b/%Y:%H:%M:%S %z").ok())
            .map(|dt| dt.with_timezone(&Utc));
        Some(extraction)
    }
}

// ============================================
// Generic syslog
// ============================================

/// Any RFC 3164 style syslog line
pub struct SyslogExtractor {
    header: SyslogHeader,
    ip_pattern: Regex,
    user_pattern: Regex,
}

impl SyslogExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(SyslogExtractor {
            header: SyslogHeader::new()?,
            ip_pattern: Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b")?,
            user_pattern: Regex::new(r"\b(?:for|user)[= ](?P<user>[A-Za-z0-9._-]+)")?,
        })
    }
}

impl FieldExtractor for SyslogExtractor {
    fn name(&self) -> &str {
        "syslog"
    }

    fn extract(&self, line: &str, received_at: DateTime<Utc>) -> Option<Extraction> {
        let mut extraction = Extraction::default();
        if !self.header.apply(line, received_at, &mut extraction) {
            return None;
        }

        let message = extraction.fields.get("message").cloned().unwrap_or_default();
        if let Some(ip) = self
            .ip_pattern
            .find(&message)
            .filter(|m| m.as_str().parse::<Ipv4Addr>().is_ok())
        {
            extraction.insert("source_ip", ip.as_str());
        }
        if let Some(user) = self.user_pattern.captures(&message).and_then(|c| c.name("user")) {
            extraction.insert("user", user.as_str());
        }
        Some(extraction)
    }
}

// ============================================
// Leading IP address
// ============================================

/// Lines of at least four tokens whose first token is an IP address
pub struct LeadingIpExtractor;

impl FieldExtractor for LeadingIpExtractor {
    fn name(&self) -> &str {
        "leading_ip"
    }

    fn extract(&self, line: &str, _received_at: DateTime<Utc>) -> Option<Extraction> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 || !is_ip(parts[0]) {
            return None;
        }

        let mut extraction = Extraction::default();
        extraction.insert("source_ip", parts[0]);
        extraction.insert("message", parts[1..].join(" "));
        Some(extraction)
    }
}

// ============================================
// Operator supplied patterns
// ============================================

/// A configured regex whose named groups become fields
pub struct PatternExtractor {
    name: String,
    pattern: Regex,
}

impl PatternExtractor {
    pub fn new(name: &str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(PatternExtractor {
            name: name.to_string(),
            pattern: Regex::new(pattern)?,
        })
    }
}

impl FieldExtractor for PatternExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&self, line: &str, _received_at: DateTime<Utc>) -> Option<Extraction> {
        let caps = self.pattern.captures(line)?;
        let mut extraction = Extraction::default();
        for group in self.pattern.capture_names().flatten() {
            if let Some(m) = caps.name(group) {
                extraction.insert(canonical_field(group), m.as_str());
            }
        }
        extraction.timestamp = extraction
            .fields
            .get("timestamp")
            .and_then(|ts| parse_timestamp(ts));
        Some(extraction)
    }
}
