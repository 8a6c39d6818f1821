use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::OutputConfig;
use crate::models::{Alert, LogEvent};
use crate::sink::{AlertSink, SinkError};

/// Output handler writing alerts to a file or stdout
pub struct OutputHandler {
    format: OutputFormat,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    forward_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Console,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            "console" => OutputFormat::Console,
            _ => OutputFormat::Jsonl, // Default
        }
    }
}

impl OutputHandler {
    /// Create a new output handler
    pub fn new(format: OutputFormat, file_path: Option<PathBuf>) -> Result<Self, SinkError> {
        let writer: Option<Box<dyn Write + Send>> = match (&format, file_path) {
            (OutputFormat::Console, _) => None,
            (_, Some(path)) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Box::new(BufWriter::new(file)))
            }
            (_, None) => None,
        };

        Ok(OutputHandler {
            format,
            writer: Mutex::new(writer),
            forward_logs: false,
        })
    }

    pub fn from_config(config: &OutputConfig) -> Result<Self, SinkError> {
        Self::new(OutputFormat::from_str(&config.format), config.file_path.clone())
    }

    /// Also write events that raised no alert
    pub fn with_forwarded_logs(mut self, enabled: bool) -> Self {
        self.forward_logs = enabled;
        self
    }

    /// Render an alert in the configured format
    pub fn render_alert(&self, alert: &Alert) -> Result<String, SinkError> {
        let rendered = match self.format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(alert)?),
            OutputFormat::Jsonl => format!("{}\n", serde_json::to_string(alert)?),
            OutputFormat::Console => {
                let score = alert
                    .anomaly_score
                    .map(|s| format!("{:.2}", s))
                    .unwrap_or_else(|| "-".to_string());
                let mut line = format!(
                    "[{}] {} rules={} score={} source={} - {}\n",
                    alert.severity.to_string().to_uppercase(),
                    alert.event_timestamp.to_rfc3339(),
                    alert.rule_summary(),
                    score,
                    alert.source,
                    alert.message
                );
                if let Some(ref enrichment) = alert.enrichment {
                    line.push_str(&format!(
                        "    {} (confidence {:.2}, {})\n",
                        enrichment.explanation, enrichment.confidence, enrichment.provider
                    ));
                }
                line
            }
        };
        Ok(rendered)
    }

    fn render_log(&self, event: &LogEvent) -> Result<String, SinkError> {
        let rendered = match self.format {
            OutputFormat::Console => format!("[log] {} {} - {}\n", event.timestamp.to_rfc3339(), event.source, event.raw_text),
            _ => format!("{}\n", serde_json::to_string(event)?),
        };
        Ok(rendered)
    }

    fn write_output(&self, data: &str) -> Result<(), SinkError> {
        let mut writer = self.writer.lock();
        match writer.as_mut() {
            Some(writer) => {
                writer.write_all(data.as_bytes())?;
                writer.flush()?;
            }
            None => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                handle.write_all(data.as_bytes())?;
                handle.flush()?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AlertSink for OutputHandler {
    fn name(&self) -> &str {
        "output"
    }

    async fn put(&self, alert: &Alert) -> Result<(), SinkError> {
        let rendered = self.render_alert(alert)?;
        self.write_output(&rendered)
    }

    async fn forward_log(&self, event: &LogEvent) -> Result<(), SinkError> {
        if !self.forward_logs {
            return Ok(());
        }
        let rendered = self.render_log(event)?;
        self.write_output(&rendered)
    }

    async fn flush(&self) -> Result<(), SinkError> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};

    fn create_event() -> LogEvent {
        LogEvent {
            id: "evt-1".to_string(),
            timestamp: Utc::now(),
            source: "auth.log".to_string(),
            raw_text: "Failed password for root".to_string(),
            parsed_fields: BTreeMap::new(),
            parse_ok: true,
            extractor: None,
        }
    }

    fn create_alert() -> Alert {
        let rules: BTreeSet<String> = ["brute_force".to_string()].into_iter().collect();
        Alert::new(&create_event(), Severity::High, rules, Some(0.81), None).unwrap()
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(OutputFormat::from_str("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("console"), OutputFormat::Console);
        assert_eq!(OutputFormat::from_str("yaml"), OutputFormat::Jsonl);
    }

    #[tokio::test]
    async fn test_jsonl_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let handler = OutputHandler::new(OutputFormat::Jsonl, Some(path.clone())).unwrap();

        handler.put(&create_alert()).await.unwrap();
        handler.put(&create_alert()).await.unwrap();
        handler.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Alert = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.event_id, "evt-1");
        assert!(parsed.rule_hits.contains("brute_force"));
    }

    #[tokio::test]
    async fn test_forward_logs_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        let quiet = OutputHandler::new(OutputFormat::Jsonl, Some(path.clone())).unwrap();
        quiet.forward_log(&create_event()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        let verbose = OutputHandler::new(OutputFormat::Jsonl, Some(path.clone()))
            .unwrap()
            .with_forwarded_logs(true);
        verbose.forward_log(&create_event()).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"raw_text\""));
    }

    #[test]
    fn test_console_rendering() {
        let handler = OutputHandler::new(OutputFormat::Console, None).unwrap();
        let line = handler.render_alert(&create_alert()).unwrap();
        assert!(line.starts_with("[HIGH]"));
        assert!(line.contains("rules=brute_force"));
        assert!(line.contains("score=0.81"));
    }
}
