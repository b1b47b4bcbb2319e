//! Anthropic Messages API client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{GenerationParams, ModelClient, ModelResponse, StopReason, Usage};
use crate::error::UpstreamError;
use crate::message::{ContentBlock, Turn};
use crate::tools::{ParameterSchema, ToolDefinition};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// HTTP client for the Messages endpoint
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicClient {
    /// Create a client; `timeout` bounds each request end to end
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::unknown(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(
        &self,
        turns: &[Turn],
        tools: &[ToolDefinition],
        params: &GenerationParams,
    ) -> Result<ModelResponse, UpstreamError> {
        let request = MessagesRequest {
            model: &params.model,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            system: params.system.as_deref(),
            messages: turns,
            tools: tools.iter().map(WireTool::from).collect(),
        };

        debug!(
            url = %self.messages_url(),
            turns = turns.len(),
            tools = tools.len(),
            "Sending messages request"
        );
        let response = self
            .client
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::network(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            let message = format!("HTTP {}: {}", status, error_message(&body));
            let mut err = UpstreamError::from_status(status.as_u16(), message);
            if let Some(delay) = retry_after {
                err = err.with_retry_after(delay);
            }
            return Err(err);
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::parse(format!("Failed to parse response: {}", e)))?;

        // Blocks we cannot interpret would be rejected if echoed back in history
        let content = parsed
            .content
            .into_iter()
            .filter(|block| !matches!(block, ContentBlock::Unsupported))
            .collect();

        Ok(ModelResponse {
            stop_reason: StopReason::parse(parsed.stop_reason.as_deref()),
            content,
            usage: parsed.usage,
        })
    }
}

fn classify_transport_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::timeout(format!("Request timeout: {}", e))
    } else if e.is_connect() || e.is_request() {
        UpstreamError::network(format!("Connection failed: {}", e))
    } else {
        UpstreamError::unknown(format!("Request failed: {}", e))
    }
}

/// Seconds form of `Retry-After`; values that do not fit a `Duration` are ignored
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Pull `error.message` out of an API error body, falling back to the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(500).collect())
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [Turn],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a ParameterSchema,
}

impl<'a> From<&'a ToolDefinition> for WireTool<'a> {
    fn from(def: &'a ToolDefinition) -> Self {
        Self {
            name: &def.name,
            description: &def.description,
            input_schema: &def.input_schema,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}
