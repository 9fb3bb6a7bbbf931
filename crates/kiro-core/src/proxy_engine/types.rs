use kiro_protocol::canonical::{CanonicalToolCall, CanonicalUsage, StopReason};

/// A fully-buffered non-stream response, after text-marker tool calls have
/// been reconciled with whatever the codec already parsed (spec §4.E
/// "Two-pass tool-call parsing").
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub text: String,
    pub tool_calls: Vec<CanonicalToolCall>,
    pub usage: CanonicalUsage,
    pub stop_reason: StopReason,
}
