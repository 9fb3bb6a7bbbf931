//! Canonical request → Kiro `conversationState` envelope (spec §4.E).

use kiro_credential::{AuthMethod, UpstreamCredentials};
use kiro_protocol::canonical::{CanonicalRequest, CanonicalRole};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::model::upstream_model_id;

/// All-but-last message becomes `history`; the last becomes
/// `currentMessage`, substituting `"Continue"` if it would otherwise be
/// empty (spec §4.E). `CanonicalRequest.system` is always `None` here — the
/// inbound translators already fold system prompts into the message list
/// (spec §4.E "system prompt fused into first history user message").
pub fn build_conversation_state(req: &CanonicalRequest, cred: &UpstreamCredentials) -> Value {
    let mut messages = req.messages.clone();
    let last = messages.pop();
    let history: Vec<Value> = messages.iter().map(history_entry).collect();

    let current_text = last
        .map(|m| m.flatten_text())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Continue".to_string());

    let mut current_message = json!({
        "content": current_text,
        "modelId": upstream_model_id(&req.model),
        "origin": "AI_EDITOR",
    });

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpecification": {
                        "name": tool.name,
                        "description": tool.description,
                        "inputSchema": { "json": tool.input_schema },
                    }
                })
            })
            .collect();
        current_message["userInputMessageContext"] = json!({ "tools": tools });
    }

    let mut conversation_state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": Uuid::new_v4().to_string(),
        "currentMessage": { "userInputMessage": current_message },
        "history": history,
    });

    // Social auth is the only auth method that carries a usable profileArn
    // (spec §4.E "social auth includes stored profileArn").
    if cred.auth_method == AuthMethod::Social
        && let Some(profile_arn) = &cred.profile_arn
    {
        conversation_state["profileArn"] = json!(profile_arn);
    }

    json!({ "conversationState": conversation_state })
}

fn history_entry(msg: &kiro_protocol::canonical::CanonicalMessage) -> Value {
    let text = msg.flatten_text();
    match msg.role {
        CanonicalRole::User => json!({ "userInputMessage": { "content": text } }),
        CanonicalRole::Assistant => json!({ "assistantResponseMessage": { "content": text } }),
    }
}

/// Kiro exposes one streaming chat endpoint per region, with a second one
/// used for `amazonq`-prefixed model ids (spec §6).
pub fn chat_endpoint(region: &str, model: &str) -> String {
    if model.starts_with("amazonq") {
        format!("https://codewhisperer.{region}.amazonaws.com/SendMessageStreaming")
    } else {
        format!("https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse")
    }
}

pub fn usage_endpoint(region: &str, profile_arn: Option<&str>) -> String {
    let mut url = format!(
        "https://q.{region}.amazonaws.com/getUsageLimits?isEmailRequired=true&origin=AI_EDITOR&resourceType=AGENTIC_REQUEST"
    );
    if let Some(profile_arn) = profile_arn {
        url.push_str("&profileArn=");
        url.push_str(&percent_encode(profile_arn));
    }
    url
}

/// Minimal query-component percent-encoding — SPEC_FULL.md §0 drops the
/// `urlencoding` crate in favor of manual encoding for the handful of
/// values (ARNs) this gateway ever puts in a query string.
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiro_protocol::canonical::CanonicalMessage;

    fn social_cred() -> UpstreamCredentials {
        UpstreamCredentials {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: i64::MAX,
            auth_method: AuthMethod::Social,
            region: "us-east-1".into(),
            start_url: None,
            sso_region: None,
            profile_arn: Some("arn:aws:iam::1:profile/x".into()),
            client_id: None,
            client_secret: None,
        }
    }

    #[test]
    fn last_message_becomes_current_and_rest_become_history() {
        let req = CanonicalRequest {
            model: "claude-sonnet-4-5".into(),
            messages: vec![
                CanonicalMessage::text(CanonicalRole::User, "hi"),
                CanonicalMessage::text(CanonicalRole::Assistant, "hello"),
                CanonicalMessage::text(CanonicalRole::User, "how are you"),
            ],
            ..Default::default()
        };
        let body = build_conversation_state(&req, &social_cred());
        let cs = &body["conversationState"];
        assert_eq!(cs["history"].as_array().unwrap().len(), 2);
        assert_eq!(
            cs["currentMessage"]["userInputMessage"]["content"],
            "how are you"
        );
        assert_eq!(cs["profileArn"], "arn:aws:iam::1:profile/x");
    }

    #[test]
    fn empty_current_message_substitutes_continue() {
        let req = CanonicalRequest {
            model: "claude-sonnet-4-5".into(),
            messages: vec![CanonicalMessage::text(CanonicalRole::User, "")],
            ..Default::default()
        };
        let body = build_conversation_state(&req, &social_cred());
        assert_eq!(
            body["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "Continue"
        );
    }

    #[test]
    fn amazonq_models_use_the_streaming_endpoint() {
        assert!(chat_endpoint("us-east-1", "amazonq-foo").ends_with("/SendMessageStreaming"));
        assert!(chat_endpoint("us-east-1", "claude-sonnet-4-5").ends_with("/generateAssistantResponse"));
    }
}
