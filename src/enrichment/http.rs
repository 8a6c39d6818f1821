//! Hosted analysis provider reached over HTTP

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::EnrichmentConfig;
use crate::enrichment::{DetectionContext, EnrichmentError, EnrichmentProvider, Explanation};
use crate::models::Severity;

#[derive(Debug, Serialize)]
struct ExplainRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    event_id: &'a str,
    timestamp: String,
    source: &'a str,
    message: &'a str,
    fields: &'a std::collections::BTreeMap<String, String>,
    rule_hits: Vec<&'a str>,
    anomaly_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ExplainResponse {
    severity: String,
    explanation: String,
    confidence: f64,
    #[serde(default)]
    recommendation: Option<String>,
}

/// POSTs the detection context as JSON and expects
/// `{"severity", "explanation", "confidence"}` back.
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpProvider {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, model: Option<String>) -> Result<Self, EnrichmentError> {
        // The enricher enforces the real deadline; this only bounds stuck sockets
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(HttpProvider {
            client,
            endpoint: endpoint.into(),
            api_key,
            model,
        })
    }

    /// Build from configuration, reading the API key from the named environment variable
    pub fn from_config(config: &EnrichmentConfig) -> Result<Self, EnrichmentError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| EnrichmentError::Provider("no endpoint configured".to_string()))?;

        let api_key = match config.api_key_env.as_deref() {
            Some(var) => match std::env::var(var) {
                Ok(key) => Some(key),
                Err(_) => {
                    log::warn!("Enrichment API key variable {} is not set", var);
                    None
                }
            },
            None => None,
        };

        Self::new(endpoint, api_key, config.model.clone())
    }
}

#[async_trait]
impl EnrichmentProvider for HttpProvider {
    fn id(&self) -> &str {
        "http"
    }

    async fn explain(&self, context: &DetectionContext) -> Result<Explanation, EnrichmentError> {
        let event = &context.event;
        let request = ExplainRequest {
            model: self.model.as_deref(),
            event_id: &event.id,
            timestamp: event.timestamp.to_rfc3339(),
            source: &event.source,
            message: &event.raw_text,
            fields: &event.parsed_fields,
            rule_hits: context.rule_hits.iter().map(String::as_str).collect(),
            anomaly_score: context.anomaly_score.map(|s| s.value),
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnrichmentError::Provider(format!("endpoint returned {}", status)));
        }

        let body: ExplainResponse = response
            .json()
            .await
            .map_err(|e| EnrichmentError::InvalidResponse(e.to_string()))?;

        let severity = Severity::parse(&body.severity).ok_or_else(|| {
            EnrichmentError::InvalidResponse(format!("unknown severity '{}'", body.severity))
        })?;
        if !body.confidence.is_finite() {
            return Err(EnrichmentError::InvalidResponse("confidence is not a number".to_string()));
        }

        Ok(Explanation {
            severity,
            explanation: body.explanation,
            confidence: body.confidence.clamp(0.0, 1.0),
            recommendation: body.recommendation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogEvent;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the request body
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/explain", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (url, handle)
    }

    fn context() -> DetectionContext {
        let mut fields = BTreeMap::new();
        fields.insert("source_ip".to_string(), "203.0.113.7".to_string());
        DetectionContext {
            event: Arc::new(LogEvent {
                id: "evt-1".to_string(),
                timestamp: Utc::now(),
                source: "auth.log".to_string(),
                raw_text: "Failed password for root".to_string(),
                parsed_fields: fields,
                parse_ok: true,
                extractor: Some("sshd".to_string()),
            }),
            rule_hits: ["brute_force".to_string()].into_iter().collect::<BTreeSet<_>>(),
            anomaly_score: None,
        }
    }

    #[tokio::test]
    async fn test_successful_explanation() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"severity":"critical","explanation":"credential stuffing","confidence":0.8}"#,
        )
        .await;
        let provider = HttpProvider::new(url, Some("secret".to_string()), Some("sec-model".to_string())).unwrap();

        let explanation = provider.explain(&context()).await.unwrap();
        assert_eq!(explanation.severity, Severity::Critical);
        assert_eq!(explanation.explanation, "credential stuffing");
        assert_eq!(explanation.confidence, 0.8);

        let request = server.await.unwrap();
        assert!(request.to_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains("\"rule_hits\":[\"brute_force\"]"));
        assert!(request.contains("\"model\":\"sec-model\""));
    }

    #[tokio::test]
    async fn test_error_status_is_provider_error() {
        let (url, _server) = serve_once("503 Service Unavailable", "{}").await;
        let provider = HttpProvider::new(url, None, None).unwrap();
        assert!(matches!(provider.explain(&context()).await, Err(EnrichmentError::Provider(_))));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let (url, _server) = serve_once("200 OK", r#"{"severity":"apocalyptic","explanation":"x","confidence":1}"#).await;
        let provider = HttpProvider::new(url, None, None).unwrap();
        assert!(matches!(
            provider.explain(&context()).await,
            Err(EnrichmentError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let config = EnrichmentConfig::default();
        assert!(HttpProvider::from_config(&config).is_err());
    }
}
