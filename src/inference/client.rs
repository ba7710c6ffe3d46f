//! Language-model client.
//!
//! [`LanguageModel`] is the seam the orchestrator calls through.
//! [`AnthropicClient`] implements it over the Anthropic Messages API with a
//! single non-streaming request per call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::types::{MessagesRequest, MessagesResponse, ModelResponse, ToolSpec, Turn};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Error bodies longer than this are cut before they reach logs and errors.
const MAX_ERROR_BODY_CHARS: usize = 1_000;

// ─── LanguageModel ───────────────────────────────────────────────────────────

/// A request/response language model that can ask for tool calls.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete the conversation `turns`, offering `tools`.
    async fn complete(
        &self,
        turns: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, InferenceError>;
}

// ─── AnthropicClient ─────────────────────────────────────────────────────────

/// Client for the Anthropic Messages API (`POST /v1/messages`).
pub struct AnthropicClient {
    http: HttpClient,
    config: ModelConfig,
    api_key: String,
    url: String,
}

impl AnthropicClient {
    /// Build a client from config. Does NOT check connectivity; that happens
    /// on the first request.
    pub fn from_config(config: ModelConfig) -> Result<Self, InferenceError> {
        let api_key = config.resolve_api_key()?;
        let url = config.messages_url();

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            api_key,
            url,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    pub fn endpoint(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    async fn complete(
        &self,
        turns: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, InferenceError> {
        let body = MessagesRequest {
            model: &self.config.model_name,
            max_tokens: self.config.max_tokens,
            system: self.config.system_prompt.as_deref(),
            messages: turns,
            tools,
        };

        // Log the request metadata (not the full body, which can be huge)
        tracing::info!(
            url = %self.url,
            model = %body.model,
            message_count = turns.len(),
            tool_count = tools.len(),
            max_tokens = body.max_tokens,
            "=== LLM REQUEST ==="
        );

        let response = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout {
                        duration_secs: self.config.request_timeout_secs,
                    }
                } else {
                    InferenceError::ConnectionFailed {
                        endpoint: self.url.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let body_text = crate::truncate_utf8(&body_text, MAX_ERROR_BODY_CHARS).to_string();
            tracing::warn!(status = status.as_u16(), body = %body_text, "model request rejected");
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let raw: MessagesResponse =
            response
                .json()
                .await
                .map_err(|e| InferenceError::InvalidResponse {
                    reason: format!("failed to decode response body: {e}"),
                })?;

        let usage = raw.usage.unwrap_or_default();
        tracing::info!(
            stop_reason = raw.stop_reason.as_deref().unwrap_or("none"),
            blocks = raw.content.len(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "=== LLM RESPONSE ==="
        );

        Ok(ModelResponse::from(raw))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::inference::types::ContentPart;

    /// One-shot HTTP server that returns `status` and `body` to the first
    /// request and hands the raw request text back.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Read headers, then as much body as Content-Length announces.
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn config_for(base_url: String) -> ModelConfig {
        ModelConfig {
            base_url,
            model_name: "claude-test".into(),
            api_key: Some("sk-test".into()),
            request_timeout_secs: 5,
            ..ModelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_complete_parses_text_and_tool_use() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"content":[{"type":"text","text":"Checking."},{"type":"tool_use","id":"tu_1","name":"forecast","input":{"city":"Oslo"}}],"stop_reason":"tool_use","usage":{"input_tokens":10,"output_tokens":5}}"#,
        )
        .await;
        let client = AnthropicClient::from_config(config_for(base_url)).unwrap();

        let tools = vec![ToolSpec {
            name: "forecast".into(),
            description: Some("Weather forecast".into()),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        }];
        let response = client
            .complete(&[Turn::user_text("weather in Oslo?")], &tools)
            .await
            .unwrap();

        assert_eq!(response.parts.len(), 2);
        assert!(matches!(response.parts[1], ContentPart::ToolUse { ref name, .. } if name == "forecast"));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/messages"));
        assert!(request.contains("x-api-key: sk-test"));
        assert!(request.contains("anthropic-version: 2023-06-01"));
        assert!(request.contains("\"forecast\""));
    }

    #[tokio::test]
    async fn test_complete_surfaces_http_error() {
        let (base_url, _server) =
            serve_once("429 Too Many Requests", r#"{"error":{"type":"rate_limit_error"}}"#).await;
        let client = AnthropicClient::from_config(config_for(base_url)).unwrap();

        let err = client
            .complete(&[Turn::user_text("hi")], &[])
            .await
            .unwrap_err();
        match err {
            InferenceError::HttpError { status, body } => {
                assert_eq!(status, 429);
                assert!(body.contains("rate_limit_error"));
            }
            other => panic!("expected HttpError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let client = AnthropicClient::from_config(config_for(format!("http://{addr}"))).unwrap();
        let err = client
            .complete(&[Turn::user_text("hi")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::ConnectionFailed { .. }));
    }
}
