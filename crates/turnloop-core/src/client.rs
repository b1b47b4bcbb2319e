//! Upstream model client contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;
use crate::message::{extract_text, extract_tool_uses, ContentBlock, ToolInvocationRequest, Turn};
use crate::tools::ToolDefinition;

/// Generation parameters sent with every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Optional system prompt, sent outside the turn history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl GenerationParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 4096,
            temperature: 0.7,
            system: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Why the model stopped generating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    /// Map the wire value (e.g. `"end_turn"`) onto a stop reason
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("end_turn") => StopReason::EndTurn,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            Some("stop_sequence") => StopReason::StopSequence,
            Some(other) => StopReason::Other(other.to_string()),
            None => StopReason::Other("none".to_string()),
        }
    }

    /// The model produced its final answer
    pub fn is_natural_end(&self) -> bool {
        matches!(self, StopReason::EndTurn | StopReason::StopSequence)
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::ToolUse => write!(f, "tool_use"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
            StopReason::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// Token accounting for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Normalized model response
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub stop_reason: StopReason,
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

impl ModelResponse {
    /// Terminal text response
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            stop_reason: StopReason::EndTurn,
            content: vec![ContentBlock::text(text)],
            usage: Usage::default(),
        }
    }

    /// Tool-use response carrying the given blocks
    pub fn tool_use(content: Vec<ContentBlock>) -> Self {
        Self {
            stop_reason: StopReason::ToolUse,
            content,
            usage: Usage::default(),
        }
    }

    /// Concatenated text blocks
    pub fn text_content(&self) -> String {
        extract_text(&self.content)
    }

    pub fn tool_uses(&self) -> Vec<ToolInvocationRequest> {
        extract_tool_uses(&self.content)
    }
}

/// Black-box RPC to the model: conversation plus tool catalog in, response out
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        turns: &[Turn],
        tools: &[ToolDefinition],
        params: &GenerationParams,
    ) -> Result<ModelResponse, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stop_reason_parse() {
        assert_eq!(StopReason::parse(Some("end_turn")), StopReason::EndTurn);
        assert_eq!(StopReason::parse(Some("tool_use")), StopReason::ToolUse);
        assert_eq!(StopReason::parse(Some("refusal")), StopReason::Other("refusal".into()));
        assert!(StopReason::StopSequence.is_natural_end());
        assert!(!StopReason::MaxTokens.is_natural_end());
    }

    #[test]
    fn test_response_helpers() {
        let response = ModelResponse::tool_use(vec![
            ContentBlock::text("Let me check."),
            ContentBlock::tool_use("t1", "echo", json!({"msg": "x"})),
        ]);
        assert_eq!(response.text_content(), "Let me check.");
        assert_eq!(response.tool_uses()[0].id, "t1");
    }
}
