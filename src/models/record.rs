//! Conversation record types for reroll.
//!
//! K_i: These types represent the core data flow through the pipeline.
//! Only assistant messages are ever rewritten; everything else passes through.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One conversation from the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier (`uuid` in older datasets)
    #[serde(default, alias = "uuid")]
    pub id: String,

    /// Conversation in order
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Tool specifications offered to the model (opaque, passed through)
    #[serde(default)]
    pub tools: Vec<Value>,

    #[serde(default)]
    pub license: Option<String>,

    #[serde(default)]
    pub used_in: Vec<String>,
}

/// A chat message, tagged by role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        #[serde(default = "empty_content")]
        content: Value,
    },
    User {
        #[serde(default = "empty_content")]
        content: Value,
    },
    Assistant(AssistantMessage),
    Tool {
        #[serde(default)]
        tool_call_id: String,
        #[serde(default = "empty_content")]
        content: Value,
    },
}

fn empty_content() -> Value {
    Value::String(String::new())
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: Value::String(content.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: Value::String(content.into()),
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: Value::String(content.into()),
        }
    }

    /// Role name as it appears on the wire.
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant(_) => "assistant",
            Self::Tool { .. } => "tool",
        }
    }
}

/// The only mutable message kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_empty")]
    pub tool_calls: Vec<ToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl AssistantMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Name of the first tool call, the one a forced turn must reproduce.
    pub fn first_tool_name(&self) -> Option<&str> {
        self.tool_calls.first().map(|tc| tc.function.name.as_str())
    }

    /// Reasoning text, if any and non-empty.
    pub fn reasoning(&self) -> Option<&str> {
        self.reasoning_content.as_deref().filter(|r| !r.is_empty())
    }

    /// Drop empty optional fields so they are not serialized.
    pub fn strip_empty(mut self) -> Self {
        if self.reasoning_content.as_deref().is_some_and(str::is_empty) {
            self.reasoning_content = None;
        }
        self
    }
}

/// A function call emitted by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub id: String,

    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,

    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: default_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Function name plus JSON-encoded arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,

    #[serde(default, deserialize_with = "arguments_as_string")]
    pub arguments: String,
}

/// Output line written for a record that could not be regenerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub error: String,
    pub original: Record,
}

impl ErrorRecord {
    pub fn new(original: Record, error: impl Into<String>) -> Self {
        Self {
            id: original.id.clone(),
            error: error.into(),
            original,
        }
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Some servers return arguments as an object instead of a JSON string.
fn arguments_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Normalize a raw dataset object to the record schema.
///
/// - `conversations` is renamed to `messages` when `messages` is absent
/// - a missing `id`/`uuid` falls back to `trial_name`
/// - missing `messages`, `tools`, `used_in` default to empty, `license` to null
pub fn normalize_record(mut raw: Value) -> Value {
    let Some(obj) = raw.as_object_mut() else {
        return raw;
    };

    if !obj.contains_key("messages") {
        if let Some(conversations) = obj.remove("conversations") {
            obj.insert("messages".to_string(), conversations);
        }
    }

    if !obj.contains_key("id") && !obj.contains_key("uuid") {
        if let Some(trial_name) = obj.get("trial_name").cloned() {
            obj.insert("id".to_string(), trial_name);
        }
    }

    for (key, default) in [
        ("messages", Value::Array(Vec::new())),
        ("tools", Value::Array(Vec::new())),
        ("used_in", Value::Array(Vec::new())),
        ("license", Value::Null),
    ] {
        match obj.get(key) {
            None | Some(Value::Null) => {
                obj.insert(key.to_string(), default);
            }
            Some(_) => {}
        }
    }

    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_record_parses_all_roles() {
        let raw = json!({
            "uuid": "rec-1",
            "messages": [
                {"role": "system", "content": "You are helpful."},
                {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "A", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "A", "content": "sunny"},
                {"role": "assistant", "content": "It is sunny in Oslo."}
            ],
            "tools": [{"type": "function", "function": {"name": "get_weather"}}],
            "license": "mit"
        });

        let record: Record = serde_json::from_value(raw).unwrap();
        assert_eq!(record.id, "rec-1");
        let roles: Vec<_> = record.messages.iter().map(Message::role).collect();
        assert_eq!(roles, ["system", "user", "assistant", "tool", "assistant"]);

        let Message::Assistant(first) = &record.messages[2] else {
            panic!("expected assistant");
        };
        assert_eq!(first.content, "");
        assert_eq!(first.first_tool_name(), Some("get_weather"));
        assert!(record.used_in.is_empty());
    }

    #[test]
    fn test_assistant_serialization_omits_empty_fields() {
        let msg = AssistantMessage {
            content: "Done.".to_string(),
            tool_calls: Vec::new(),
            reasoning_content: Some(String::new()),
        };
        let value = serde_json::to_value(Message::Assistant(msg.strip_empty())).unwrap();
        assert_eq!(value, json!({"role": "assistant", "content": "Done."}));
    }

    #[test]
    fn test_record_serializes_id_not_uuid() {
        let record = Record {
            id: "r".to_string(),
            messages: vec![Message::user("hi")],
            tools: Vec::new(),
            license: None,
            used_in: vec!["sft-v2".to_string()],
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "r");
        assert!(value.get("uuid").is_none());
        assert_eq!(value["messages"][0], json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_object_arguments_become_json_string() {
        let call: ToolCall = serde_json::from_value(json!({
            "id": "c1",
            "function": {"name": "lookup", "arguments": {"q": "rust"}}
        }))
        .unwrap();
        assert_eq!(call.call_type, "function");
        assert_eq!(call.function.arguments, r#"{"q":"rust"}"#);
    }

    #[test]
    fn test_normalize_renames_conversations() {
        let raw = json!({
            "trial_name": "trial-7",
            "conversations": [{"role": "user", "content": "hi"}]
        });
        let normalized = normalize_record(raw);
        assert_eq!(normalized["id"], "trial-7");
        assert!(normalized.get("conversations").is_none());
        assert_eq!(normalized["messages"].as_array().unwrap().len(), 1);
        assert_eq!(normalized["tools"], json!([]));
        assert_eq!(normalized["license"], Value::Null);

        let record: Record = serde_json::from_value(normalized).unwrap();
        assert_eq!(record.id, "trial-7");
    }

    #[test]
    fn test_normalize_keeps_existing_messages() {
        let raw = json!({
            "uuid": "u",
            "messages": [{"role": "user", "content": "a"}],
            "conversations": [{"role": "user", "content": "b"}]
        });
        let normalized = normalize_record(raw);
        assert_eq!(normalized["messages"][0]["content"], "a");
        assert_eq!(normalized["uuid"], "u");
        assert!(normalized.get("id").is_none());
    }

    #[test]
    fn test_error_record_shape() {
        let original = Record {
            id: "bad".to_string(),
            messages: Vec::new(),
            tools: Vec::new(),
            license: None,
            used_in: Vec::new(),
        };
        let value = serde_json::to_value(ErrorRecord::new(original, "boom")).unwrap();
        assert_eq!(value["id"], "bad");
        assert_eq!(value["error"], "boom");
        assert_eq!(value["original"]["id"], "bad");
    }
}
