#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("upstream {0} not found")]
    NotFound(i64),
    #[error("upstream {0} is missing client credentials required for its auth method")]
    MissingClientCredentials(i64),
    #[error("token refresh request failed: {0}")]
    RefreshRequestFailed(String),
    #[error("token refresh response could not be parsed: {0}")]
    RefreshResponseInvalid(String),
    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("unknown oauth session {0}")]
    SessionNotFound(String),
    #[error("oauth session {0} already {1}")]
    InvalidState(String, &'static str),
    #[error("no loopback port available in 19876..=19880")]
    NoLoopbackPort,
    #[error("oauth provider request failed: {0}")]
    ProviderRequestFailed(String),
    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
}
