//! Inbound → canonical translation (spec §4.E).

use kiro_protocol::canonical::{
    CanonicalContentPart, CanonicalMessage, CanonicalRequest, CanonicalRole, ToolSpec,
};
use kiro_protocol::claude::{ContentBlock, MessageContent, MessagesRequest};
use kiro_protocol::openai::{ChatCompletionRequest, ChatContent};

/// OpenAI dialect: content arrays flatten to text, `system` role messages
/// become a synthetic user message prefixed `[System]: `.
pub fn openai_to_canonical(req: &ChatCompletionRequest) -> CanonicalRequest {
    let mut messages = Vec::with_capacity(req.messages.len());
    for m in &req.messages {
        let text = m.content.flatten_to_text();
        let role = match m.role.as_str() {
            "system" => {
                messages.push(CanonicalMessage::text(
                    CanonicalRole::User,
                    format!("[System]: {text}"),
                ));
                continue;
            }
            "assistant" => CanonicalRole::Assistant,
            _ => CanonicalRole::User,
        };
        messages.push(CanonicalMessage::text(role, text));
    }

    let mut out = CanonicalRequest {
        model: req.model.clone(),
        system: None,
        messages,
        tools: Vec::new(),
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
    };
    merge_consecutive_same_role(&mut out.messages);
    out
}

/// Anthropic dialect: top-level `system` becomes a synthetic
/// user/assistant("Understood.") pair preserving strict alternation;
/// `tool_use`/`tool_result` blocks render as bracket markers so the
/// upstream (which only accepts plain text) can still carry them, and the
/// stream encoder reconstructs structured tool calls from those markers on
/// the way back out (spec §4.E "Tool-call reconstruction from text").
pub fn claude_to_canonical(req: &MessagesRequest) -> CanonicalRequest {
    let mut messages = Vec::new();

    if let Some(system) = &req.system {
        let text = system.flatten();
        if !text.is_empty() {
            messages.push(CanonicalMessage::text(
                CanonicalRole::User,
                format!("[System]: {text}"),
            ));
            messages.push(CanonicalMessage::text(CanonicalRole::Assistant, "Understood."));
        }
    }

    for m in &req.messages {
        let role = if m.role == "assistant" {
            CanonicalRole::Assistant
        } else {
            CanonicalRole::User
        };
        let text = render_message_content(&m.content);
        messages.push(CanonicalMessage::text(role, text));
    }

    merge_consecutive_same_role(&mut messages);

    let tools = req
        .tools
        .iter()
        .map(|t| ToolSpec {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.input_schema.clone(),
        })
        .collect();

    CanonicalRequest {
        model: req.model.clone(),
        system: None,
        messages,
        tools,
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: None,
        stream: req.stream,
    }
}

fn render_message_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(s) => s.clone(),
        MessageContent::Blocks(blocks) => {
            let mut out = String::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => out.push_str(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        out.push_str(&format!(
                            "[Called {name} ({id}) with args: {}]",
                            serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string())
                        ));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let tag = if *is_error { "[Error]" } else { "" };
                        out.push_str(&format!(
                            "[Tool result ({tool_use_id}){tag}: {}]",
                            content.flatten()
                        ));
                    }
                }
            }
            out
        }
    }
}

fn merge_consecutive_same_role(messages: &mut Vec<CanonicalMessage>) {
    let mut merged: Vec<CanonicalMessage> = Vec::with_capacity(messages.len());
    for msg in messages.drain(..) {
        if let Some(last) = merged.last_mut() {
            if last.role == msg.role {
                last.parts.extend(msg.parts);
                continue;
            }
        }
        merged.push(msg);
    }
    *messages = merged;
}

/// Used when the in-band marker `CanonicalContentPart::ToolUse`/`ToolResult`
/// form is constructed directly (rather than via text flattening), e.g. in
/// tests. Kept separate from `render_message_content` because production
/// inbound payloads arrive pre-flattened from the wire types above.
pub fn parts_to_text(parts: &[CanonicalContentPart]) -> String {
    parts
        .iter()
        .map(|p| match p {
            CanonicalContentPart::Text(t) => t.clone(),
            CanonicalContentPart::ToolUse { id, name, input } => format!(
                "[Called {name} ({id}) with args: {}]",
                serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string())
            ),
            CanonicalContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let tag = if *is_error { "[Error]" } else { "" };
                format!("[Tool result ({tool_use_id}){tag}: {content}]")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiro_protocol::claude::InputMessage;

    #[test]
    fn openai_system_message_becomes_prefixed_user_message() {
        let req = ChatCompletionRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![
                kiro_protocol::openai::ChatMessage {
                    role: "system".to_string(),
                    content: ChatContent::Text("be terse".to_string()),
                },
                kiro_protocol::openai::ChatMessage {
                    role: "user".to_string(),
                    content: ChatContent::Text("hi".to_string()),
                },
            ],
            stream: false,
            max_tokens: None,
            temperature: None,
            top_p: None,
        };
        let canonical = openai_to_canonical(&req);
        assert_eq!(canonical.messages.len(), 2);
        assert_eq!(canonical.messages[0].flatten_text(), "[System]: be terse");
    }

    #[test]
    fn claude_system_prepends_understood_pair() {
        let req = MessagesRequest {
            model: "claude-haiku-4-5".to_string(),
            messages: vec![InputMessage {
                role: "user".to_string(),
                content: MessageContent::Text("hi".to_string()),
            }],
            system: Some(kiro_protocol::claude::SystemField::Text("be terse".to_string())),
            max_tokens: 100,
            stream: false,
            temperature: None,
            tools: Vec::new(),
        };
        let canonical = claude_to_canonical(&req);
        assert_eq!(canonical.messages[0].flatten_text(), "[System]: be terse");
        assert_eq!(canonical.messages[1].flatten_text(), "Understood.");
        assert_eq!(canonical.messages[2].flatten_text(), "hi");
    }

    #[test]
    fn consecutive_same_role_messages_merge() {
        let req = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![
                kiro_protocol::openai::ChatMessage {
                    role: "user".to_string(),
                    content: ChatContent::Text("a".to_string()),
                },
                kiro_protocol::openai::ChatMessage {
                    role: "user".to_string(),
                    content: ChatContent::Text("b".to_string()),
                },
            ],
            stream: false,
            max_tokens: None,
            temperature: None,
            top_p: None,
        };
        let canonical = openai_to_canonical(&req);
        assert_eq!(canonical.messages.len(), 1);
        assert_eq!(canonical.messages[0].flatten_text(), "ab");
    }
}
