//! Text-marker tool-call reconstruction (spec §4.E "Tool-call reconstruction
//! from text", §9 "Two-pass tool-call parsing").
//!
//! The upstream's plain-text stream occasionally embeds a tool call as
//! `[Called <name> (<id>)? with args: {...}]`. `]` characters inside the
//! JSON argument string must not terminate the marker, so this is a
//! bracket-depth scan rather than a regex.

use kiro_protocol::canonical::CanonicalToolCall;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const MARKER_PREFIX: &str = "[Called ";

/// Scans `text` for every well-formed `[Called ...]` marker.
pub fn extract_tool_calls(text: &str) -> Vec<CanonicalToolCall> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut search_from = 0;

    while let Some(rel) = text[search_from..].find(MARKER_PREFIX) {
        let start = search_from + rel;
        match find_marker_end(bytes, start) {
            Some(end) => {
                let inner = &text[start + 1..end]; // drop leading '[', trailing ']' excluded
                if let Some(call) = parse_marker_body(inner) {
                    out.push(call);
                }
                search_from = end + 1;
            }
            None => break,
        }
    }

    out
}

/// Finds the index of the `]` that closes the marker opened at `start`
/// (which points at the `[`), treating `]` inside a JSON string literal as
/// non-terminating. Returns `None` if the marker never closes.
fn find_marker_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'[' | b'{' => depth += 1,
                b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                b'}' => depth -= 1,
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// `inner` is the marker body without the surrounding `[`/`]`, e.g.
/// `Called Search (tooluse_abc) with args: {"q":"go"}`.
fn parse_marker_body(inner: &str) -> Option<CanonicalToolCall> {
    let rest = inner.strip_prefix("Called ")?;
    let (head, args_part) = rest.split_once(" with args:")?;
    let args_part = args_part.trim_start();

    let (name, id) = match head.rfind('(') {
        Some(paren) if head.trim_end().ends_with(')') => {
            let name = head[..paren].trim().to_string();
            let id = head[paren + 1..head.trim_end().len() - 1].trim().to_string();
            (name, id)
        }
        _ => (head.trim().to_string(), String::new()),
    };
    if name.is_empty() {
        return None;
    }

    let id = if id.is_empty() {
        normalize_tool_id(None)
    } else {
        normalize_tool_id(Some(&id))
    };

    let input = parse_or_repair_json(args_part);
    Some(CanonicalToolCall { id, name, input })
}

/// Best-effort JSON repair: strips trailing commas before `}`/`]` and quotes
/// bare object keys. Falls back to the raw string wrapped as `{"raw": ...}`
/// so a tool call is still emitted on parse failure (spec §4.E).
fn parse_or_repair_json(raw: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return v;
    }

    let repaired = quote_bare_keys(&strip_trailing_commas(raw));
    serde_json::from_str::<Value>(&repaired)
        .unwrap_or_else(|_| serde_json::json!({ "raw": raw }))
}

fn strip_trailing_commas(raw: &str) -> String {
    let mut repaired = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = raw[i..].chars().next().unwrap();
        if in_string {
            repaired.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else {
            match c {
                '"' => {
                    in_string = true;
                    repaired.push(c);
                }
                ',' => {
                    let next_non_ws = raw[i + 1..].trim_start().chars().next();
                    if !matches!(next_non_ws, Some('}') | Some(']')) {
                        repaired.push(c);
                    }
                }
                _ => repaired.push(c),
            }
        }
        i += c.len_utf8();
    }
    repaired
}

/// Wraps bare identifier keys (`{k: 1}` → `{"k": 1}`) in double quotes.
/// Only triggers right after `{` or `,` (skipping whitespace), so quoted
/// keys and string values are left untouched.
fn quote_bare_keys(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut expect_key = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                expect_key = false;
                out.push(c);
                i += 1;
            }
            '{' | ',' => {
                out.push(c);
                expect_key = true;
                i += 1;
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            c if expect_key && (c.is_alphanumeric() || c == '_' || c == '$') => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                out.push('"');
                out.push_str(&word);
                out.push('"');
                expect_key = false;
            }
            _ => {
                expect_key = false;
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn normalize_tool_id(id: Option<&str>) -> String {
    const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    if let Some(id) = id
        && id.starts_with("toolu_")
        && id.len() == 30
    {
        return id.to_string();
    }

    let seed = id.map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut hasher_input = seed.into_bytes();
    hasher_input.extend_from_slice(Uuid::new_v4().as_bytes());
    let digest = sha256_like(&hasher_input);

    let mut suffix = String::with_capacity(24);
    for byte in digest.iter().cycle().take(24) {
        suffix.push(ALPHABET.as_bytes()[(*byte as usize) % ALPHABET.len()] as char);
    }
    format!("toolu_{suffix}")
}

fn sha256_like(input: &[u8]) -> [u8; 32] {
    Sha256::digest(input).into()
}

/// Merges codec-derived tool calls with calls reconstructed from the final
/// accumulated text, deduping the combined set (spec §9 "Two-pass tool-call
/// parsing"). Text extraction only runs when the text actually contains a
/// marker, since `extract_tool_calls` is a no-op scan otherwise.
pub fn reconcile_tool_calls(text: &str, codec_calls: Vec<CanonicalToolCall>) -> Vec<CanonicalToolCall> {
    let mut all = codec_calls;
    if text.contains(MARKER_PREFIX) {
        all.extend(extract_tool_calls(text));
    }
    dedup_tool_calls(all)
}

/// De-dups codec-derived and text-extracted tool calls by `(name,
/// canonical-json(input))` (spec §9).
pub fn dedup_tool_calls(calls: Vec<CanonicalToolCall>) -> Vec<CanonicalToolCall> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(calls.len());
    for call in calls {
        let key = (call.name.clone(), call.input.to_string());
        if seen.insert(key) {
            out.push(call);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracket_close_inside_json_string_does_not_end_marker() {
        let text = r#"prefix [Called X with args: {"k":"]"}] suffix"#;
        let calls = extract_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "X");
        assert_eq!(calls[0].input["k"], "]");
    }

    #[test]
    fn extracts_name_and_id() {
        let text = r#"[Called Search (tooluse_abc) with args: {"q":"go"}]"#;
        let calls = extract_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Search");
        assert_eq!(calls[0].input["q"], "go");
    }

    #[test]
    fn trailing_comma_is_repaired() {
        let text = r#"[Called X with args: {"a":1,}]"#;
        let calls = extract_tool_calls(text);
        assert_eq!(calls[0].input["a"], 1);
    }

    #[test]
    fn malformed_json_still_emits_raw_call() {
        let text = r#"[Called X with args: {not json}]"#;
        let calls = extract_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].input.get("raw").is_some());
    }

    #[test]
    fn bare_keys_are_quoted() {
        let text = r#"[Called X with args: {a: 1, b: "two"}]"#;
        let calls = extract_tool_calls(text);
        assert_eq!(calls[0].input["a"], 1);
        assert_eq!(calls[0].input["b"], "two");
    }

    #[test]
    fn reconcile_merges_codec_and_text_calls_without_duplicates() {
        let codec_calls = vec![CanonicalToolCall {
            id: "toolu_a".into(),
            name: "Search".into(),
            input: serde_json::json!({"q": "go"}),
        }];
        let text = r#"some text [Called Search (toolu_a) with args: {"q":"go"}] more"#;
        let merged = reconcile_tool_calls(text, codec_calls);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn reconcile_skips_extraction_when_no_marker_present() {
        let merged = reconcile_tool_calls("plain text, no markers here", Vec::new());
        assert!(merged.is_empty());
    }

    #[test]
    fn dedup_drops_repeats_with_same_name_and_input() {
        let calls = vec![
            CanonicalToolCall {
                id: "a".into(),
                name: "X".into(),
                input: serde_json::json!({"q": 1}),
            },
            CanonicalToolCall {
                id: "b".into(),
                name: "X".into(),
                input: serde_json::json!({"q": 1}),
            },
        ];
        assert_eq!(dedup_tool_calls(calls).len(), 1);
    }
}
