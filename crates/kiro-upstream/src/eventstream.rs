//! Event-Stream Codec (spec §4.D): scans a rolling byte buffer for the
//! earliest of five JSON sentinel prefixes, brace-matches the object with
//! string/escape awareness, and classifies it into a canonical stream
//! event. Incomplete trailing data is retained until more bytes arrive.

use std::collections::HashMap;

use kiro_protocol::canonical::{CanonicalStreamEvent, CanonicalToolCall};
use serde_json::Value;
use sha2::{Digest, Sha256};

const SENTINELS: [&str; 5] = [
    r#"{"content":"#,
    r#"{"name":"#,
    r#"{"input":"#,
    r#"{"stop":"#,
    r#"{"contextUsagePercentage":"#,
];

struct PendingToolCall {
    tool_use_id: String,
    name: String,
    input_buf: String,
}

#[derive(Default)]
pub struct EventStreamCodec {
    buf: Vec<u8>,
    tool_calls: HashMap<String, PendingToolCall>,
    /// Insertion order of open tool-call keys, so a bare `{"stop":true}`
    /// with no `toolUseId` closes the most recently opened call.
    open_order: Vec<String>,
    last_content: Option<String>,
}

impl EventStreamCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<CanonicalStreamEvent> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(value) = self.try_extract_one() {
            if let Some(event) = self.classify(value) {
                out.push(event);
            }
        }
        out
    }

    fn try_extract_one(&mut self) -> Option<Value> {
        let text = std::str::from_utf8(&self.buf).ok()?;
        let start = SENTINELS
            .iter()
            .filter_map(|pat| text.find(pat))
            .min()?;
        let end = brace_match_end(text, start)?;
        let value = serde_json::from_str::<Value>(&text[start..end]).ok();
        self.buf.drain(0..end);
        value
    }

    fn classify(&mut self, value: Value) -> Option<CanonicalStreamEvent> {
        if let Some(content) = value.get("content").and_then(Value::as_str) {
            self.last_content = None; // reset on any non-adjacent other event boundary below
            return self.classify_content(content, value.get("followupPrompt").is_some());
        }

        if let Some(name) = value.get("name").and_then(Value::as_str) {
            return self.classify_tool_start(name, &value);
        }

        if let Some(input) = value.get("input").and_then(Value::as_str) {
            return self.classify_tool_continuation(input, &value);
        }

        if let Some(stop) = value.get("stop").and_then(Value::as_bool) {
            if stop {
                return self.close_most_recent();
            }
            return None;
        }

        // `contextUsagePercentage` is telemetry only — spec §4.D has no
        // canonical event for it.
        None
    }

    fn classify_content(&mut self, content: &str, has_followup: bool) -> Option<CanonicalStreamEvent> {
        if content.is_empty() || has_followup {
            return None;
        }
        if self.last_content.as_deref() == Some(content) {
            return None;
        }
        self.last_content = Some(content.to_string());
        Some(CanonicalStreamEvent::TextDelta(content.to_string()))
    }

    fn classify_tool_start(&mut self, name: &str, value: &Value) -> Option<CanonicalStreamEvent> {
        let tool_use_id = value.get("toolUseId").and_then(Value::as_str).unwrap_or("").to_string();
        let key = if tool_use_id.is_empty() { name.to_string() } else { tool_use_id.clone() };
        let fragment = value.get("input").and_then(Value::as_str);
        let stop = value.get("stop").and_then(Value::as_bool).unwrap_or(false);

        if !self.tool_calls.contains_key(&key) {
            self.tool_calls.insert(
                key.clone(),
                PendingToolCall {
                    tool_use_id,
                    name: name.to_string(),
                    input_buf: String::new(),
                },
            );
            self.open_order.push(key.clone());
        }
        if let Some(fragment) = fragment
            && let Some(entry) = self.tool_calls.get_mut(&key)
        {
            entry.input_buf.push_str(fragment);
        }
        if stop { self.finish_tool_call(&key) } else { None }
    }

    fn classify_tool_continuation(&mut self, fragment: &str, value: &Value) -> Option<CanonicalStreamEvent> {
        let stop = value.get("stop").and_then(Value::as_bool).unwrap_or(false);
        let key = match value.get("toolUseId").and_then(Value::as_str) {
            Some(id) if self.tool_calls.contains_key(id) => Some(id.to_string()),
            _ => self.open_order.last().cloned(),
        };
        let Some(key) = key else { return None };
        if let Some(entry) = self.tool_calls.get_mut(&key) {
            entry.input_buf.push_str(fragment);
        }
        if stop { self.finish_tool_call(&key) } else { None }
    }

    fn close_most_recent(&mut self) -> Option<CanonicalStreamEvent> {
        let key = self.open_order.last().cloned()?;
        self.finish_tool_call(&key)
    }

    fn finish_tool_call(&mut self, key: &str) -> Option<CanonicalStreamEvent> {
        let pending = self.tool_calls.remove(key)?;
        self.open_order.retain(|k| k != key);
        let input = parse_tool_input(&pending.input_buf);
        let id = normalize_tool_use_id(&pending.tool_use_id);
        Some(CanonicalStreamEvent::ToolCall(CanonicalToolCall {
            id,
            name: pending.name,
            input,
        }))
    }
}

/// Finds the index one past the `}` that closes the object opened at
/// `start` (which points at `{`), ignoring braces inside JSON string
/// literals. Returns `None` if the object isn't complete yet.
fn brace_match_end(text: &str, start: usize) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_tool_input(buf: &str) -> Value {
    serde_json::from_str(buf).unwrap_or_else(|_| serde_json::json!({ "raw": buf }))
}

fn normalize_tool_use_id(id: &str) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    if id.starts_with("toolu_") && id.len() == 30 {
        return id.to_string();
    }
    let seed = if id.is_empty() { uuid::Uuid::new_v4().to_string() } else { id.to_string() };
    let digest = Sha256::digest(seed.as_bytes());
    let suffix: String = digest
        .iter()
        .cycle()
        .take(24)
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect();
    format!("toolu_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_is_emitted_for_content_events() {
        let mut codec = EventStreamCodec::new();
        let events = codec.push_bytes(br#"{"content":"hello"}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], CanonicalStreamEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn adjacent_duplicate_content_is_suppressed() {
        let mut codec = EventStreamCodec::new();
        let events = codec.push_bytes(br#"{"content":"hi"}{"content":"hi"}{"content":"there"}"#);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn incomplete_object_waits_for_more_bytes() {
        let mut codec = EventStreamCodec::new();
        let events = codec.push_bytes(br#"{"content":"he"#);
        assert!(events.is_empty());
        let events = codec.push_bytes(br#"llo"}"#);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn tool_call_assembles_across_fragments_and_closes_on_stop() {
        let mut codec = EventStreamCodec::new();
        let mut events = codec.push_bytes(br#"{"name":"Search","toolUseId":"tu_1","input":"{\"q\":"}"#);
        events.extend(codec.push_bytes(br#"{"input":"\"go\"}","toolUseId":"tu_1"}"#));
        events.extend(codec.push_bytes(br#"{"stop":true,"toolUseId":"tu_1"}"#));
        assert_eq!(events.len(), 1);
        match &events[0] {
            CanonicalStreamEvent::ToolCall(call) => {
                assert_eq!(call.name, "Search");
                assert_eq!(call.input["q"], "go");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn bracket_in_json_string_does_not_confuse_brace_matching() {
        let mut codec = EventStreamCodec::new();
        let events = codec.push_bytes(br#"{"content":"a } b"}"#);
        assert_eq!(events.len(), 1);
    }
}
