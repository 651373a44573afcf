//! The completion seam between the regeneration engine and a model endpoint.

use crate::models::{AssistantMessage, Message, Result, TokenUsage};
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use serde_json::{Value, json};

/// How the model may use the offered tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// Tools are disabled for this call (`"none"`)
    None,
    /// The model must call the named function
    Function(String),
}

impl Serialize for ToolChoice {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::None => serializer.serialize_str("none"),
            Self::Function(name) => json!({
                "type": "function",
                "function": { "name": name }
            })
            .serialize(serializer),
        }
    }
}

/// One chat completion call.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    /// Context so far
    pub messages: &'a [Message],
    /// Tool specifications of the record; only sent with a forced tool choice
    pub tools: &'a [Value],
    /// `None` leaves the choice to the server (omitted when the record has no tools)
    pub tool_choice: Option<&'a ToolChoice>,
    /// Ask the chat template to emit a thinking trace
    pub thinking: bool,
}

/// Result of one successful call.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub message: AssistantMessage,
    pub usage: TokenUsage,
}

/// Anything that can answer a chat completion request.
///
/// Implemented by [`crate::client::LLMClient`]; tests script their own.
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_choice_serialization() {
        assert_eq!(serde_json::to_value(ToolChoice::None).unwrap(), json!("none"));
        assert_eq!(
            serde_json::to_value(ToolChoice::Function("get_weather".to_string())).unwrap(),
            json!({"type": "function", "function": {"name": "get_weather"}})
        );
    }
}
