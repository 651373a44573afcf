//! Turn-by-turn regeneration of one record.
//!
//! Epistemic foundation:
//! - K_i: Only assistant turns change; system/user/tool content passes through
//! - K_i: A forced turn reuses the original tool *name*, never its arguments
//! - B_i: The model produces usable text with thinking on (might not) → one retry
//! - I^B: Any call may fail → the original assistant message is the fallback

use crate::client::{ChatCompleter, CompletionRequest, ToolChoice};
use crate::models::{AssistantMessage, Message, Record, Result, TokenStats, ToolCall};
use crate::rerollout::ToolCallRegistry;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Minimum trimmed length of an acceptable text turn, in characters.
pub const MIN_TEXT_CHARS: usize = 30;

/// Prefixes of a tool name regurgitated as prose.
const TOOL_NAME_PREFIXES: [&str; 2] = ["get_", "check_"];

/// Whether a text turn produced real prose.
///
/// Kept exactly as the datasets were produced with: short replies and
/// replies starting with `get_`/`check_` count as degenerate, which also
/// rejects some legitimate short answers.
pub fn is_valid_text(content: &str) -> bool {
    let trimmed = content.trim();
    trimmed.chars().count() >= MIN_TEXT_CHARS
        && !TOOL_NAME_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

/// Shape of an original assistant turn, which decides how it is regenerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnKind {
    /// Tool calls and no content: force the tool
    ToolOnly { tool: String },
    /// No tool calls: generate text with tools disabled
    TextOnly,
    /// Tool calls and content: preamble first, then the forced tool
    Both { tool: String },
}

impl TurnKind {
    pub fn classify(original: &AssistantMessage) -> Self {
        match original.first_tool_name() {
            None => Self::TextOnly,
            Some(tool) if original.content.trim().is_empty() => Self::ToolOnly {
                tool: tool.to_string(),
            },
            Some(tool) => Self::Both {
                tool: tool.to_string(),
            },
        }
    }
}

/// Outcome of the two-attempt text sub-state machine.
#[derive(Debug, Clone)]
pub enum TextAttempt {
    /// The thinking attempt produced valid text
    Accepted(AssistantMessage),
    /// The thinking attempt was degenerate and a plain attempt followed
    Retried {
        first: AssistantMessage,
        retry: AssistantMessage,
    },
}

impl TextAttempt {
    /// Merge into the message to emit.
    ///
    /// After a retry, content comes from the retry and reasoning from the
    /// first attempt only. Text turns never carry tool calls.
    pub fn into_message(self) -> AssistantMessage {
        match self {
            Self::Accepted(message) => AssistantMessage {
                content: message.content,
                tool_calls: Vec::new(),
                reasoning_content: message.reasoning_content,
            },
            Self::Retried { first, retry } => AssistantMessage {
                content: retry.content,
                tool_calls: Vec::new(),
                reasoning_content: first.reasoning_content,
            },
        }
    }
}

/// Combine the reasoning of a two-phase turn.
fn merge_reasoning(preamble: Option<&str>, tool: Option<&str>) -> Option<String> {
    match (preamble, tool) {
        (Some(p), Some(t)) => Some(format!(
            "[Preamble reasoning]\n{p}\n\n[Tool call reasoning]\n{t}"
        )),
        (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
        (None, None) => None,
    }
}

/// The original message as emitted when regeneration of a turn fails.
fn fallback(original: &AssistantMessage) -> AssistantMessage {
    AssistantMessage {
        content: original.content.clone(),
        tool_calls: original.tool_calls.clone(),
        reasoning_content: None,
    }
}

/// Give every regenerated call an id a tool message can point at.
fn ensure_call_ids(calls: &mut [ToolCall]) {
    for call in calls.iter_mut().filter(|c| c.id.is_empty()) {
        call.id = format!("call_{}", Uuid::new_v4().simple());
    }
}

/// Regenerates the assistant turns of a record with a replacement model.
pub struct TurnRegenerator {
    client: Arc<dyn ChatCompleter>,
    stats: Arc<TokenStats>,
}

impl TurnRegenerator {
    pub fn new(client: Arc<dyn ChatCompleter>, stats: Arc<TokenStats>) -> Self {
        Self { client, stats }
    }

    /// Token accumulator fed by every successful call.
    pub fn stats(&self) -> &Arc<TokenStats> {
        &self.stats
    }

    async fn call(
        &self,
        context: &[Message],
        tools: &[Value],
        tool_choice: &ToolChoice,
        thinking: bool,
    ) -> Result<AssistantMessage> {
        let completion = self
            .client
            .complete(CompletionRequest {
                messages: context,
                tools,
                tool_choice: Some(tool_choice),
                thinking,
            })
            .await?;
        self.stats.add(completion.usage);
        Ok(completion.message)
    }

    /// Regenerate every assistant turn of `record`.
    ///
    /// B_i(each turn regenerates) → per-turn fallback to the original message
    /// I^B(endpoint unreachable) → Err, the caller records the failure
    pub async fn regenerate(&self, record: &Record) -> Result<Record> {
        let original = &record.messages;
        // The context sent to the model is always exactly the output so far.
        let mut output: Vec<Message> = Vec::with_capacity(original.len());
        let mut registry = ToolCallRegistry::new();

        let mut i = 0;
        while i < original.len() {
            match &original[i] {
                msg @ (Message::System { .. } | Message::User { .. }) => {
                    output.push(msg.clone());
                    i += 1;
                }
                Message::Assistant(orig) => {
                    let message = match self.regenerate_turn(&output, &record.tools, orig).await {
                        Ok(message) => message,
                        Err(e) if e.is_turn_recoverable() => {
                            warn!(record = %record.id, turn = i, error = %e, "Turn failed, keeping original");
                            fallback(orig)
                        }
                        Err(e) => return Err(e),
                    }
                    .strip_empty();
                    i += 1;

                    registry.register(&orig.tool_calls, &message.tool_calls);
                    let turn_calls = message.tool_calls.clone();
                    output.push(Message::Assistant(message));

                    while let Some(Message::Tool {
                        tool_call_id,
                        content,
                    }) = original.get(i)
                    {
                        match registry.resolve(tool_call_id, &turn_calls) {
                            Some(new_id) => {
                                debug!(record = %record.id, from = %tool_call_id, to = %new_id, "Remapped tool response");
                                output.push(Message::Tool {
                                    tool_call_id: new_id.to_string(),
                                    content: content.clone(),
                                });
                            }
                            None => {
                                debug!(record = %record.id, tool_call_id = %tool_call_id, "Dropped tool response without a tool call");
                            }
                        }
                        i += 1;
                    }
                }
                Message::Tool { .. } => {
                    debug!(record = %record.id, turn = i, "Skipped tool message without a preceding assistant turn");
                    i += 1;
                }
            }
        }

        Ok(Record {
            id: record.id.clone(),
            messages: output,
            tools: record.tools.clone(),
            license: record.license.clone(),
            used_in: record.used_in.clone(),
        })
    }

    async fn regenerate_turn(
        &self,
        context: &[Message],
        tools: &[Value],
        original: &AssistantMessage,
    ) -> Result<AssistantMessage> {
        let mut message = match TurnKind::classify(original) {
            TurnKind::ToolOnly { tool } => {
                debug!(tool = %tool, "Forcing tool call");
                let message = self.forced_tool(context, tools, &tool).await?;
                match Self::check_tool_identity(message, &tool) {
                    Some(message) => message,
                    None => fallback(original),
                }
            }
            TurnKind::TextOnly => {
                debug!("Generating text (tool_choice=none)");
                self.text(context, tools).await?.into_message()
            }
            TurnKind::Both { tool } => {
                debug!(tool = %tool, "Generating preamble, then forcing tool call");
                self.preamble_then_tool(context, tools, &tool, original).await?
            }
        };

        ensure_call_ids(&mut message.tool_calls);
        Ok(message)
    }

    /// A forced turn must not come back with a different function.
    fn check_tool_identity(message: AssistantMessage, tool: &str) -> Option<AssistantMessage> {
        match message.first_tool_name() {
            Some(name) if name != tool => {
                warn!(expected = %tool, got = %name, "Model ignored forced tool, keeping original");
                None
            }
            _ => Some(message),
        }
    }

    async fn forced_tool(
        &self,
        context: &[Message],
        tools: &[Value],
        tool: &str,
    ) -> Result<AssistantMessage> {
        let choice = ToolChoice::Function(tool.to_string());
        self.call(context, tools, &choice, true).await
    }

    /// Thinking first; one plain retry if the text is degenerate.
    async fn text(&self, context: &[Message], tools: &[Value]) -> Result<TextAttempt> {
        let first = self.call(context, tools, &ToolChoice::None, true).await?;
        if is_valid_text(&first.content) {
            return Ok(TextAttempt::Accepted(first));
        }

        debug!(content = %first.content, "Thinking produced invalid content, retrying without thinking");
        let retry = self.call(context, tools, &ToolChoice::None, false).await?;
        Ok(TextAttempt::Retried { first, retry })
    }

    /// Two-phase turn: content-only preamble, then the forced tool.
    async fn preamble_then_tool(
        &self,
        context: &[Message],
        tools: &[Value],
        tool: &str,
        original: &AssistantMessage,
    ) -> Result<AssistantMessage> {
        let preamble = self.call(context, tools, &ToolChoice::None, true).await?;
        let forced = match Self::check_tool_identity(self.forced_tool(context, tools, tool).await?, tool) {
            Some(forced) => forced,
            None => return Ok(fallback(original)),
        };

        Ok(AssistantMessage {
            reasoning_content: merge_reasoning(preamble.reasoning(), forced.reasoning()),
            content: preamble.content,
            tool_calls: forced.tool_calls,
        })
    }
}
