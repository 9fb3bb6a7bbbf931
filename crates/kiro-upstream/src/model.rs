//! Supported model ids and the fixed mapping to Kiro's internal model ids
//! (spec §4.E, §6 "Supported model ids").

/// The only model ids this gateway accepts from either dialect.
pub const SUPPORTED_MODELS: &[&str] = &[
    "claude-opus-4-5",
    "claude-opus-4-5-20251101",
    "claude-haiku-4-5",
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-20250929",
    "claude-sonnet-4-20250514",
    "claude-3-7-sonnet-20250219",
];

pub fn is_supported(model: &str) -> bool {
    SUPPORTED_MODELS.contains(&model)
}

/// Maps a supported inbound model id to the id Kiro expects in
/// `currentMessage.userInputMessage.modelId`. Only `claude-sonnet-4-5` and
/// `claude-opus-4-5` have a documented mapping (spec §4.E); the remaining
/// entries follow the same `CLAUDE_<NAME>_<DATE>_V1_0` shape observed for
/// those two and are a best-effort extrapolation, noted as such in
/// DESIGN.md.
pub fn upstream_model_id(model: &str) -> &str {
    match model {
        "claude-sonnet-4-5" | "claude-sonnet-4-5-20250929" => "CLAUDE_SONNET_4_5_20250929_V1_0",
        "claude-opus-4-5" | "claude-opus-4-5-20251101" => "claude-opus-4.5",
        "claude-haiku-4-5" => "CLAUDE_HAIKU_4_5_20251001_V1_0",
        "claude-sonnet-4-20250514" => "CLAUDE_SONNET_4_20250514_V1_0",
        "claude-3-7-sonnet-20250219" => "CLAUDE_3_7_SONNET_20250219_V1_0",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_models() {
        assert!(!is_supported("gpt-4o"));
        assert!(is_supported("claude-sonnet-4-5"));
    }

    #[test]
    fn maps_documented_models() {
        assert_eq!(upstream_model_id("claude-sonnet-4-5"), "CLAUDE_SONNET_4_5_20250929_V1_0");
        assert_eq!(upstream_model_id("claude-opus-4-5"), "claude-opus-4.5");
    }
}
