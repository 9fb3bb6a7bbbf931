//! Dialect-agnostic gateway error (spec §7). `kiro-router` maps each
//! variant onto the Claude/OpenAI error body shape for its dialect; this
//! crate has no `axum` dependency and never builds an HTTP response
//! itself.

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown or unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("no upstream available")]
    NoUpstreamAvailable,
    #[error("request failed after retries: {0}")]
    RetriesExhausted(String),
    #[error("upstream error: {0}")]
    Upstream(#[from] kiro_upstream::UpstreamError),
    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
    #[error("credential error: {0}")]
    Credential(#[from] kiro_credential::CredentialError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<kiro_credential::SelectorError> for GatewayError {
    fn from(err: kiro_credential::SelectorError) -> Self {
        match err {
            kiro_credential::SelectorError::NoUpstreamAvailable => GatewayError::NoUpstreamAvailable,
            kiro_credential::SelectorError::Storage(e) => GatewayError::Storage(e),
            kiro_credential::SelectorError::RetriesExhausted(msg) => GatewayError::RetriesExhausted(msg),
        }
    }
}
