#[derive(Debug, thiserror::Error, Clone)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream access token expired (403)")]
    TokenExpired,
    #[error("upstream rate limited (429)")]
    RateLimited,
    #[error("upstream server error ({0})")]
    ServerError(u16),
    #[error("upstream returned unexpected status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("credential refresh failed: {0}")]
    CredentialRefresh(String),
}

impl UpstreamError {
    /// Per spec §4.F/§7: 429, 5xx and transient transport failures are
    /// retried with backoff; 403 is handled one level up (refresh-once);
    /// everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Transport(_) | UpstreamError::Timeout | UpstreamError::RateLimited | UpstreamError::ServerError(_)
        )
    }
}
