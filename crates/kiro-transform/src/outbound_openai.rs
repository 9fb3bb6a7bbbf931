//! Canonical stream → OpenAI SSE (spec §4.E).
//!
//! OpenAI chunks carry no separate tool-call content blocks the way
//! Anthropic's stream does; the gateway renders any reconstructed tool
//! calls as trailing text inside the same `delta.content` stream, since
//! `/v1/chat/completions` callers of this gateway consume tool-call
//! markers as plain text (spec §4.E "Canonical stream → OpenAI SSE").

use kiro_protocol::canonical::{CanonicalStreamEvent, CanonicalToolCall, CanonicalUsage};
use kiro_protocol::openai::{
    ChatCompletionChunk, ChatCompletionChunkChoice, ChatCompletionDelta, ChatCompletionChoice,
    ChatCompletionMessageOut, ChatCompletionResponse, ChatCompletionUsage,
};
use kiro_protocol::sse::SseEvent;

use crate::toolcall::dedup_tool_calls;

const DONE_MARKER: &str = "[DONE]";

pub struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    tool_calls: Vec<CanonicalToolCall>,
}

impl OpenAiStreamEncoder {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            role_sent: false,
            tool_calls: Vec::new(),
        }
    }

    pub fn push(&mut self, event: CanonicalStreamEvent) -> Vec<SseEvent> {
        match event {
            CanonicalStreamEvent::TextDelta(text) => vec![self.chunk(Some(text), None)],
            CanonicalStreamEvent::ToolCall(call) => {
                self.tool_calls.push(call);
                Vec::new()
            }
            CanonicalStreamEvent::Done { usage, .. } => self.finish(usage),
            CanonicalStreamEvent::Error(message) => {
                let mut events = vec![self.chunk(Some(message), None)];
                events.extend(self.finish(CanonicalUsage::default()));
                events
            }
        }
    }

    fn chunk(&mut self, content: Option<String>, finish_reason: Option<&'static str>) -> SseEvent {
        let role = if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some("assistant")
        };
        let payload = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatCompletionChunkChoice {
                index: 0,
                delta: ChatCompletionDelta { role, content },
                finish_reason,
            }],
        };
        to_sse(&payload)
    }

    fn finish(&mut self, _usage: CanonicalUsage) -> Vec<SseEvent> {
        let mut out = Vec::new();
        let calls = dedup_tool_calls(std::mem::take(&mut self.tool_calls));
        for call in &calls {
            let marker = format!(
                "[Called {} ({}) with args: {}]",
                call.name,
                call.id,
                call.input
            );
            out.push(self.chunk(Some(marker), None));
        }
        let finish_reason = if calls.is_empty() { "stop" } else { "tool_calls" };
        out.push(self.chunk(None, Some(finish_reason)));
        out.push(SseEvent {
            event: None,
            data: DONE_MARKER.to_string(),
        });
        out
    }

    pub fn into_response(
        self,
        mut text: String,
        tool_calls: Vec<CanonicalToolCall>,
        usage: CanonicalUsage,
    ) -> ChatCompletionResponse {
        for call in dedup_tool_calls(tool_calls) {
            text.push_str(&format!(
                "[Called {} ({}) with args: {}]",
                call.name, call.id, call.input
            ));
        }
        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion",
            created: self.created,
            model: self.model,
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: ChatCompletionMessageOut {
                    role: "assistant",
                    content: text,
                },
                finish_reason: "stop",
            }],
            usage: ChatCompletionUsage {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
                total_tokens: usage.total(),
            },
        }
    }
}

fn to_sse(chunk: &ChatCompletionChunk) -> SseEvent {
    SseEvent {
        event: None,
        data: serde_json::to_string(chunk).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiro_protocol::canonical::StopReason;

    #[test]
    fn first_chunk_carries_role_only_once() {
        let mut enc = OpenAiStreamEncoder::new("chatcmpl_1", "claude-sonnet-4-5", 0);
        let first = enc.push(CanonicalStreamEvent::TextDelta("hi".into()));
        let second = enc.push(CanonicalStreamEvent::TextDelta(" there".into()));
        assert!(first[0].data.contains("\"role\":\"assistant\""));
        assert!(!second[0].data.contains("\"role\""));
    }

    #[test]
    fn done_marker_terminates_stream() {
        let mut enc = OpenAiStreamEncoder::new("chatcmpl_1", "m", 0);
        let events = enc.push(CanonicalStreamEvent::Done {
            usage: CanonicalUsage::default(),
            stop_reason: StopReason::EndTurn,
        });
        assert_eq!(events.last().unwrap().data, "[DONE]");
    }

    #[test]
    fn tool_calls_render_as_trailing_marker_text() {
        let mut enc = OpenAiStreamEncoder::new("chatcmpl_1", "m", 0);
        enc.push(CanonicalStreamEvent::ToolCall(CanonicalToolCall {
            id: "toolu_x".into(),
            name: "Search".into(),
            input: serde_json::json!({"q": 1}),
        }));
        let events = enc.push(CanonicalStreamEvent::Done {
            usage: CanonicalUsage::default(),
            stop_reason: StopReason::ToolUse,
        });
        assert!(events[0].data.contains("[Called Search (toolu_x)"));
        assert!(events[1].data.contains("tool_calls"));
    }
}
