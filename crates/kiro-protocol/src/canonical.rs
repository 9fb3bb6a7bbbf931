//! Dialect-neutral request/response shapes shared by the OpenAI and
//! Anthropic translators (spec §4.E).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalRole {
    User,
    Assistant,
}

/// Per spec §9 "Dynamic-typed request bodies": a tagged variant the
/// translators walk structurally, never dispatching on runtime shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalContentPart {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone)]
pub struct CanonicalMessage {
    pub role: CanonicalRole,
    pub parts: Vec<CanonicalContentPart>,
}

impl CanonicalMessage {
    pub fn text(role: CanonicalRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![CanonicalContentPart::Text(text.into())],
        }
    }

    /// Flattens text parts into a single string, dropping tool parts. Used
    /// when building the upstream `conversationState` body (spec §4.E).
    pub fn flatten_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                CanonicalContentPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl CanonicalUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// One collected tool call, fully buffered (codec-derived or text-extracted,
/// see spec §4.D/§4.E "Two-pass tool-call parsing").
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Lazily-produced unit of a canonical response stream. Translators consume
/// this sequence and emit their own lazy byte sequence (spec §9 "Stream
/// adaptation") — nothing here is ever materialized as a whole response
/// except the final `Done` usage tally.
#[derive(Debug, Clone)]
pub enum CanonicalStreamEvent {
    TextDelta(String),
    ToolCall(CanonicalToolCall),
    Done {
        usage: CanonicalUsage,
        stop_reason: StopReason,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    Error,
}
