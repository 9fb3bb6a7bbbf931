//! OAuth Driver: the three interactive grant flows (spec §4.C).
//!
//! Grounded on `gproxy-provider-impl::providers::codex::oauth`'s
//! device-code/authorization-code split and TTL sweep, and
//! `providers::claudecode::mod.rs`'s `generate_state_and_pkce`. The loopback
//! callback server is net new: the teacher's OAuth flows are always
//! callback-via-the-gateway's-own HTTP surface, never a server bound on the
//! end user's machine.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use rand::RngCore;
use serde::Deserialize;
use sha2::Digest;
use tokio::net::TcpListener;

use kiro_store::Store;

use crate::credential::{AuthMethod, UpstreamCredentials};
use crate::errors::OAuthError;

const LOOPBACK_PORT_RANGE: std::ops::RangeInclusive<u16> = 19876..=19880;
const BUILDER_ID_START_URL: &str = "https://view.awsapps.com/start";
const SOCIAL_AUTH_BASE: &str = "https://prod.us-east-1.auth.desktop.kiro.dev";
const IDC_REGION_ALLOWLIST: &[&str] = &[
    "us-east-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-northeast-1",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthKind {
    Social,
    BuilderId,
    IdentityCenter,
}

impl OAuthKind {
    fn as_str(self) -> &'static str {
        match self {
            OAuthKind::Social => "social",
            OAuthKind::BuilderId => "builder-id",
            OAuthKind::IdentityCenter => "identity-center",
        }
    }
}

/// What `OAuthDriver::start` hands back to the caller to display/open.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OAuthStartResult {
    pub session_id: String,
    pub auth_url: Option<String>,
    pub verification_uri_complete: Option<String>,
    pub user_code: Option<String>,
}

pub struct OAuthDriver {
    store: Store,
    client: wreq::Client,
}

impl OAuthDriver {
    pub fn new(store: Store, client: wreq::Client) -> Self {
        Self { store, client }
    }

    pub async fn start_social(&self, provider: &str) -> Result<OAuthStartResult, OAuthError> {
        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);
        let session_id = generate_session_id();
        let (port, listener) = bind_first_free_loopback_port()
            .await
            .ok_or(OAuthError::NoLoopbackPort)?;
        let redirect_uri = format!("http://127.0.0.1:{port}/oauth/callback");

        // The session id doubles as the OAuth `state` parameter: the
        // callback handler looks the session up directly by it instead of
        // scanning payloads for a separately-generated value.
        let payload = serde_json::json!({
            "codeVerifier": code_verifier,
            "redirectUri": redirect_uri,
        });
        let session = self
            .store
            .create_oauth_session(
                session_id.clone(),
                OAuthKind::Social.as_str().to_string(),
                Some(provider.to_string()),
                "us-east-1".to_string(),
                payload,
            )
            .await?;

        spawn_loopback_callback_server(listener, self.store.clone(), self.client.clone());

        let auth_url = format!(
            "{base}/authorize?provider={provider}&redirect_uri={redirect}&code_challenge={challenge}&code_challenge_method=S256&state={session_id}",
            base = SOCIAL_AUTH_BASE,
            redirect = urlencoding_encode(&redirect_uri),
            challenge = code_challenge,
        );

        Ok(OAuthStartResult {
            session_id: session.id,
            auth_url: Some(auth_url),
            verification_uri_complete: None,
            user_code: None,
        })
    }

    pub async fn start_builder_id(&self) -> Result<OAuthStartResult, OAuthError> {
        self.start_device_code(OAuthKind::BuilderId, "us-east-1", BUILDER_ID_START_URL)
            .await
    }

    pub async fn start_identity_center(
        &self,
        region: &str,
        start_url: &str,
    ) -> Result<OAuthStartResult, OAuthError> {
        if !IDC_REGION_ALLOWLIST.contains(&region) {
            return Err(OAuthError::ProviderRequestFailed(format!(
                "region {region} is not allow-listed for Identity Center"
            )));
        }
        let parsed = url::Url::parse(start_url)
            .map_err(|e| OAuthError::ProviderRequestFailed(format!("invalid start url: {e}")))?;
        if parsed.scheme() != "https" || !parsed.path().ends_with("/start") {
            return Err(OAuthError::ProviderRequestFailed(
                "start url must be https and end in /start".to_string(),
            ));
        }
        self.start_device_code(OAuthKind::IdentityCenter, region, start_url)
            .await
    }

    async fn start_device_code(
        &self,
        kind: OAuthKind,
        region: &str,
        start_url: &str,
    ) -> Result<OAuthStartResult, OAuthError> {
        let oidc_base = format!("https://oidc.{region}.amazonaws.com");
        let registration = self.register_client(&oidc_base).await?;
        let device_auth = self
            .request_device_authorization(&oidc_base, &registration, start_url)
            .await?;

        let payload = serde_json::json!({
            "clientId": registration.client_id,
            "clientSecret": registration.client_secret,
            "deviceCode": device_auth.device_code,
            "userCode": device_auth.user_code,
            "interval": device_auth.interval,
            "expiresAt": now_unix_ms() + device_auth.expires_in * 1000,
            "startUrl": start_url,
        });
        let session = self
            .store
            .create_oauth_session(
                generate_session_id(),
                kind.as_str().to_string(),
                None,
                region.to_string(),
                payload,
            )
            .await?;

        Ok(OAuthStartResult {
            session_id: session.id,
            auth_url: None,
            verification_uri_complete: Some(device_auth.verification_uri_complete),
            user_code: Some(device_auth.user_code),
        })
    }

    /// Polls a pending device-code session once. Callers loop this at the
    /// session's `interval` until it returns a terminal status.
    pub async fn poll_device_code(&self, session_id: &str) -> Result<(), OAuthError> {
        let session = self
            .store
            .get_oauth_session(session_id)
            .await?
            .ok_or_else(|| OAuthError::SessionNotFound(session_id.to_string()))?;
        if session.status != "pending" {
            return Err(OAuthError::InvalidState(session_id.to_string(), "not pending"));
        }

        let payload: DevicePollPayload = serde_json::from_value(session.payload.clone())
            .map_err(|e| OAuthError::ProviderRequestFailed(e.to_string()))?;
        if now_unix_ms() > payload.expires_at {
            self.store
                .fail_oauth_session(session_id, "timeout".to_string())
                .await?;
            return Ok(());
        }

        let oidc_base = format!("https://oidc.{}.amazonaws.com", session.region);
        let body = serde_json::json!({
            "clientId": payload.client_id,
            "clientSecret": payload.client_secret,
            "deviceCode": payload.device_code,
            "grantType": "urn:ietf:params:oauth:grant-type:device_code",
        });
        let resp = self
            .client
            .post(format!("{oidc_base}/token"))
            .json(&body)
            .send()
            .await
            .map_err(|e| OAuthError::ProviderRequestFailed(e.to_string()))?;

        if resp.status().is_success() {
            let token: DeviceTokenResponse = resp
                .json()
                .await
                .map_err(|e| OAuthError::ProviderRequestFailed(e.to_string()))?;
            let creds = UpstreamCredentials {
                access_token: token.access_token,
                refresh_token: token.refresh_token.unwrap_or_default(),
                expires_at: now_unix_ms() + token.expires_in * 1000,
                auth_method: if session.kind == OAuthKind::BuilderId.as_str() {
                    AuthMethod::BuilderId
                } else {
                    AuthMethod::IdC
                },
                region: session.region.clone(),
                start_url: payload.start_url.clone(),
                sso_region: Some(session.region.clone()),
                profile_arn: None,
                client_id: Some(payload.client_id.clone()),
                client_secret: Some(payload.client_secret.clone()),
            };
            self.store
                .complete_oauth_session(
                    session_id,
                    serde_json::to_value(&creds).unwrap_or_default(),
                )
                .await?;
            return Ok(());
        }

        let status = resp.status();
        let error: DeviceErrorResponse = resp.json().await.unwrap_or(DeviceErrorResponse {
            error: format!("http_{status}"),
        });
        match error.error.as_str() {
            // `slow_down` asks the poller to back off by 5s; the caller
            // controls its own poll cadence so there is nothing to persist
            // here beyond treating it like ordinary pending.
            "authorization_pending" | "slow_down" => Ok(()),
            other => {
                self.store
                    .fail_oauth_session(session_id, other.to_string())
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn cancel(&self, session_id: &str) -> Result<(), OAuthError> {
        self.store
            .fail_oauth_session(session_id, "cancelled".to_string())
            .await?;
        Ok(())
    }

    async fn register_client(
        &self,
        oidc_base: &str,
    ) -> Result<ClientRegistration, OAuthError> {
        let body = serde_json::json!({
            "clientName": "kiro-gateway",
            "clientType": "public",
            "scopes": ["codewhisperer:completions"],
        });
        let resp = self
            .client
            .post(format!("{oidc_base}/client/register"))
            .json(&body)
            .send()
            .await
            .map_err(|e| OAuthError::ProviderRequestFailed(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| OAuthError::ProviderRequestFailed(e.to_string()))
    }

    async fn request_device_authorization(
        &self,
        oidc_base: &str,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> Result<DeviceAuthorization, OAuthError> {
        let body = serde_json::json!({
            "clientId": registration.client_id,
            "clientSecret": registration.client_secret,
            "startUrl": start_url,
        });
        let resp = self
            .client
            .post(format!("{oidc_base}/device_authorization"))
            .json(&body)
            .send()
            .await
            .map_err(|e| OAuthError::ProviderRequestFailed(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| OAuthError::ProviderRequestFailed(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ClientRegistration {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "clientSecret")]
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorization {
    #[serde(rename = "deviceCode")]
    device_code: String,
    #[serde(rename = "userCode")]
    user_code: String,
    #[serde(rename = "verificationUriComplete")]
    verification_uri_complete: String,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
    interval: i64,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct DevicePollPayload {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "clientSecret")]
    client_secret: String,
    #[serde(rename = "deviceCode")]
    device_code: String,
    interval: i64,
    #[serde(rename = "expiresAt")]
    expires_at: i64,
    #[serde(rename = "startUrl")]
    start_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken", default)]
    refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct DeviceErrorResponse {
    error: String,
}

// ---- Social loopback callback server -----------------------------------

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn bind_first_free_loopback_port() -> Option<(u16, TcpListener)> {
    for port in LOOPBACK_PORT_RANGE {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            return Some((port, listener));
        }
    }
    None
}

fn spawn_loopback_callback_server(listener: TcpListener, store: Store, client: wreq::Client) {
    let shared = Arc::new((store, client));
    let app = Router::new()
        .route("/oauth/callback", get(handle_callback))
        .with_state(shared);
    tokio::spawn(async move {
        let server = axum::serve(listener, app.into_make_service());
        // The matching OAuthSession is swept after 10 minutes regardless;
        // this just bounds how long the loopback socket stays bound.
        tokio::select! {
            _ = server => {}
            _ = tokio::time::sleep(Duration::from_secs(600)) => {}
        }
    });
}

async fn handle_callback(
    Query(query): Query<CallbackQuery>,
    State(shared): State<Arc<(Store, wreq::Client)>>,
) -> impl IntoResponse {
    let (store, client) = (&shared.0, &shared.1);
    if let Some(error) = query.error {
        return Html(format!("<h1>OAuth failed</h1><p>{error}</p>"));
    }
    let (Some(code), Some(state)) = (query.code, query.state) else {
        return Html("<h1>OAuth failed</h1><p>missing code or state</p>".to_string());
    };

    match finish_social_exchange(store, client, &code, &state).await {
        Ok(()) => Html("<h1>You're all set</h1><p>You can close this window.</p>".to_string()),
        Err(e) => Html(format!("<h1>OAuth failed</h1><p>{e}</p>")),
    }
}

async fn finish_social_exchange(
    store: &Store,
    client: &wreq::Client,
    code: &str,
    state: &str,
) -> Result<(), OAuthError> {
    let session = store
        .get_oauth_session(state)
        .await?
        .ok_or_else(|| OAuthError::SessionNotFound(state.to_string()))?;
    if session.status != "pending" {
        return Err(OAuthError::InvalidState(state.to_string(), "not pending"));
    }
    let payload: serde_json::Value = session.payload.clone();
    let code_verifier = payload
        .get("codeVerifier")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let redirect_uri = payload
        .get("redirectUri")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let body = serde_json::json!({
        "code": code,
        "codeVerifier": code_verifier,
        "redirectUri": redirect_uri,
    });
    let resp = client
        .post(format!("{SOCIAL_AUTH_BASE}/oauth/token"))
        .json(&body)
        .send()
        .await
        .map_err(|e| OAuthError::ProviderRequestFailed(e.to_string()))?;
    let token: DeviceTokenResponse = resp
        .json()
        .await
        .map_err(|e| OAuthError::ProviderRequestFailed(e.to_string()))?;

    let creds = UpstreamCredentials {
        access_token: token.access_token,
        refresh_token: token.refresh_token.unwrap_or_default(),
        expires_at: now_unix_ms() + token.expires_in * 1000,
        auth_method: AuthMethod::Social,
        region: "us-east-1".to_string(),
        start_url: None,
        sso_region: None,
        profile_arn: None,
        client_id: None,
        client_secret: None,
    };
    store
        .complete_oauth_session(
            &session.id,
            serde_json::to_value(&creds).unwrap_or_default(),
        )
        .await?;
    Ok(())
}

fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn generate_code_challenge(verifier: &str) -> String {
    let digest = sha2::Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn urlencoding_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

use base64::Engine;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_challenge_is_deterministic_for_same_verifier() {
        let verifier = "fixed-verifier-value";
        assert_eq!(generate_code_challenge(verifier), generate_code_challenge(verifier));
    }

    #[test]
    fn idc_region_allowlist_rejects_unknown_region() {
        assert!(!IDC_REGION_ALLOWLIST.contains(&"mars-central-1"));
    }
}
