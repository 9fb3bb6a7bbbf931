//! Canonical stream → Anthropic SSE (spec §4.E).
//!
//! Text deltas are forwarded as they arrive; tool calls are buffered and
//! only emitted after the text block closes, so ordering is always
//! text-before-tool-calls (spec §5 "Ordering guarantees").

use kiro_protocol::canonical::{CanonicalStreamEvent, CanonicalToolCall, CanonicalUsage, StopReason};
use kiro_protocol::claude::{
    ContentDelta, MessageDeltaPayload, MessageStartPayload, MessagesUsage, ResponseBlock,
    ResponseBlockStart, StreamEvent,
};
use kiro_protocol::sse::SseEvent;

use crate::toolcall::dedup_tool_calls;

pub struct ClaudeStreamEncoder {
    message_id: String,
    model: String,
    text_block_open: bool,
    text_block_started: bool,
    next_index: u32,
    tool_calls: Vec<CanonicalToolCall>,
}

impl ClaudeStreamEncoder {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            text_block_open: false,
            text_block_started: false,
            next_index: 0,
            tool_calls: Vec::new(),
        }
    }

    pub fn start(&self) -> Vec<SseEvent> {
        vec![to_sse(&StreamEvent::MessageStart {
            message: MessageStartPayload {
                id: self.message_id.clone(),
                kind: "message",
                role: "assistant",
                model: self.model.clone(),
                content: Vec::new(),
                usage: MessagesUsage {
                    input_tokens: 0,
                    output_tokens: 0,
                },
            },
        })]
    }

    /// Feeds one canonical event, returning zero or more SSE events to
    /// flush to the client immediately.
    pub fn push(&mut self, event: CanonicalStreamEvent) -> Vec<SseEvent> {
        match event {
            CanonicalStreamEvent::TextDelta(text) => self.push_text_delta(text),
            CanonicalStreamEvent::ToolCall(call) => {
                self.tool_calls.push(call);
                Vec::new()
            }
            CanonicalStreamEvent::Done { usage, stop_reason } => self.finish(usage, stop_reason, None),
            CanonicalStreamEvent::Error(message) => {
                self.finish(CanonicalUsage::default(), StopReason::Error, Some(message))
            }
        }
    }

    fn push_text_delta(&mut self, text: String) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !self.text_block_started {
            self.text_block_started = true;
            self.text_block_open = true;
            out.push(to_sse(&StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseBlockStart::Text { text: String::new() },
            }));
            self.next_index = 1;
        }
        out.push(to_sse(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta { text },
        }));
        out
    }

    fn finish(
        &mut self,
        usage: CanonicalUsage,
        stop_reason: StopReason,
        error: Option<String>,
    ) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if self.text_block_open {
            out.push(to_sse(&StreamEvent::ContentBlockStop { index: 0 }));
            self.text_block_open = false;
        }

        let calls = dedup_tool_calls(std::mem::take(&mut self.tool_calls));
        for call in &calls {
            let index = self.next_index;
            self.next_index += 1;
            out.push(to_sse(&StreamEvent::ContentBlockStart {
                index,
                content_block: ResponseBlockStart::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: serde_json::Value::Object(Default::default()),
                },
            }));
            out.push(to_sse(&StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::InputJsonDelta {
                    partial_json: call.input.to_string(),
                },
            }));
            out.push(to_sse(&StreamEvent::ContentBlockStop { index }));
        }

        let stop_reason_str = if error.is_some() {
            "error"
        } else if !calls.is_empty() {
            "tool_use"
        } else {
            "end_turn"
        };
        let _ = stop_reason;

        out.push(to_sse(&StreamEvent::MessageDelta {
            delta: MessageDeltaPayload {
                stop_reason: stop_reason_str,
            },
            usage: MessagesUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            },
        }));
        out.push(to_sse(&StreamEvent::MessageStop));
        out
    }

    /// Builds a full non-stream response body for non-streaming requests.
    pub fn into_response(
        self,
        text: String,
        tool_calls: Vec<CanonicalToolCall>,
        usage: CanonicalUsage,
    ) -> kiro_protocol::claude::MessagesResponse {
        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(ResponseBlock::Text { text });
        }
        for call in dedup_tool_calls(tool_calls) {
            content.push(ResponseBlock::ToolUse {
                id: call.id,
                name: call.name,
                input: call.input,
            });
        }
        let stop_reason = if content.iter().any(|b| matches!(b, ResponseBlock::ToolUse { .. })) {
            "tool_use"
        } else {
            "end_turn"
        };
        kiro_protocol::claude::MessagesResponse {
            id: self.message_id,
            kind: "message",
            role: "assistant",
            model: self.model,
            content,
            stop_reason,
            usage: MessagesUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            },
        }
    }
}

fn to_sse(event: &StreamEvent) -> SseEvent {
    let name = match event {
        StreamEvent::MessageStart { .. } => "message_start",
        StreamEvent::ContentBlockStart { .. } => "content_block_start",
        StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
        StreamEvent::ContentBlockStop { .. } => "content_block_stop",
        StreamEvent::MessageDelta { .. } => "message_delta",
        StreamEvent::MessageStop => "message_stop",
    };
    SseEvent {
        event: Some(name.to_string()),
        data: serde_json::to_string(event).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiro_protocol::canonical::CanonicalToolCall;

    #[test]
    fn text_then_tool_call_ordering() {
        let mut enc = ClaudeStreamEncoder::new("msg_1", "claude-haiku-4-5");
        let mut events = enc.start();
        events.extend(enc.push(CanonicalStreamEvent::TextDelta("thinking ".into())));
        events.extend(enc.push(CanonicalStreamEvent::ToolCall(CanonicalToolCall {
            id: "toolu_abc".into(),
            name: "Search".into(),
            input: serde_json::json!({"q": "go"}),
        })));
        events.extend(enc.push(CanonicalStreamEvent::Done {
            usage: CanonicalUsage::default(),
            stop_reason: StopReason::ToolUse,
        }));

        let names: Vec<&str> = events.iter().map(|e| e.event.as_deref().unwrap()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(events[7].data.contains("tool_use"));
    }
}
