mod model_unavailable_queue;
mod pool;
mod state;
mod unavailable_queue;

pub use pool::{AcquireError, CredentialPool};
pub use state::{CredentialId, CredentialState, UnavailableReason};

use serde::{Deserialize, Serialize};

/// The credentials blob held inside `Upstream.credentials` (spec §3).
/// `clientId`/`clientSecret` are required to refresh `builder-id`/`IdC`
/// grants; social refresh needs neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamCredentials {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    /// Unix millis.
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    #[serde(rename = "authMethod")]
    pub auth_method: AuthMethod,
    pub region: String,
    #[serde(rename = "startUrl", skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,
    #[serde(rename = "ssoRegion", skip_serializing_if = "Option::is_none")]
    pub sso_region: Option<String>,
    #[serde(rename = "profileArn", skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "clientSecret", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Social,
    BuilderId,
    #[serde(rename = "IdC")]
    IdC,
}

impl UpstreamCredentials {
    /// True once the access token is within `safety_window_ms` of expiry.
    pub fn needs_refresh(&self, now_unix_ms: i64, safety_window_ms: i64) -> bool {
        self.expires_at - now_unix_ms <= safety_window_ms
    }

    /// `clientId`/`clientSecret` are only mandatory outside the social flow
    /// (spec §3 "Credentials blob").
    pub fn requires_client_credentials(&self) -> bool {
        !matches!(self.auth_method, AuthMethod::Social)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn social_credentials_do_not_require_client_secret() {
        let cred = UpstreamCredentials {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: 0,
            auth_method: AuthMethod::Social,
            region: "us-east-1".into(),
            start_url: None,
            sso_region: None,
            profile_arn: None,
            client_id: None,
            client_secret: None,
        };
        assert!(!cred.requires_client_credentials());
    }

    #[test]
    fn needs_refresh_honors_safety_window() {
        let cred = UpstreamCredentials {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: 10_000,
            auth_method: AuthMethod::BuilderId,
            region: "us-east-1".into(),
            start_url: None,
            sso_region: None,
            profile_arn: None,
            client_id: Some("c".into()),
            client_secret: Some("s".into()),
        };
        assert!(cred.needs_refresh(9_500, 1_000));
        assert!(!cred.needs_refresh(1_000, 1_000));
    }
}
