//! Credential Manager: transparent access-token refresh (spec §4.B).
//!
//! Grounded on `CredentialPool`'s availability cache, generalized with a
//! per-upstream refresh lock so concurrent callers for the same upstream
//! coalesce onto a single outbound refresh request instead of racing
//! (spec §8 "Refresh coalescing").

use std::collections::HashMap;
use std::sync::Arc;

use kiro_store::Store;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use crate::credential::{AuthMethod, CredentialId, CredentialPool, UpstreamCredentials};
use crate::errors::CredentialError;
use crate::events::{CredentialEvent, Event};

const SOCIAL_REFRESH_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";
const IDC_REFRESH_URL_TEMPLATE: &str = "https://oidc.{region}.amazonaws.com/token";
const DEFAULT_SAFETY_WINDOW_MS: i64 = 120_000;

#[derive(Debug, Deserialize)]
struct SocialRefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken", default)]
    refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct IdcRefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken", default)]
    refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

pub struct CredentialManager {
    store: Store,
    pool: Arc<CredentialPool>,
    client: wreq::Client,
    safety_window_ms: i64,
    refresh_locks: RwLock<HashMap<CredentialId, Arc<Mutex<()>>>>,
}

impl CredentialManager {
    pub fn new(store: Store, pool: Arc<CredentialPool>, client: wreq::Client) -> Self {
        Self {
            store,
            pool,
            client,
            safety_window_ms: DEFAULT_SAFETY_WINDOW_MS,
            refresh_locks: RwLock::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, id: CredentialId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.refresh_locks.read().await.get(&id) {
            return lock.clone();
        }
        self.refresh_locks
            .write()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns credentials guaranteed fresh as of the call, refreshing first
    /// if within `safety_window_ms` of expiry. Concurrent callers for the
    /// same `id` block on one another rather than issuing duplicate refresh
    /// requests — the second caller re-checks expiry after acquiring the
    /// lock and finds the first caller's refresh already applied.
    pub async fn ensure_fresh(
        &self,
        id: CredentialId,
        cred: UpstreamCredentials,
    ) -> Result<UpstreamCredentials, CredentialError> {
        if !cred.needs_refresh(now_unix_ms(), self.safety_window_ms) {
            return Ok(cred);
        }

        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let row = self
            .store
            .get_upstream(id)
            .await?
            .ok_or(CredentialError::NotFound(id))?;
        let current: UpstreamCredentials = serde_json::from_value(row.credentials)
            .map_err(|e| CredentialError::RefreshResponseInvalid(e.to_string()))?;
        if !current.needs_refresh(now_unix_ms(), self.safety_window_ms) {
            return Ok(current);
        }

        let refreshed = self.refresh(id, &current).await?;
        self.store
            .update_upstream_credentials(
                id,
                serde_json::to_value(&refreshed).unwrap_or_default(),
            )
            .await?;
        self.pool.update_credential(id, refreshed.clone()).await;
        self.pool
            .events()
            .emit(Event::Credential(CredentialEvent::TokenRefreshed {
                at: std::time::SystemTime::now(),
                credential_id: id,
            }))
            .await;
        Ok(refreshed)
    }

    /// Refreshes unconditionally, ignoring `expires_at` — used after a 403
    /// from the upstream (spec §4.F "403 once → force refresh"), where the
    /// access token is already known to be invalid regardless of its
    /// claimed expiry. Coalesces with concurrent `ensure_fresh`/
    /// `force_refresh` calls for the same id the same way.
    pub async fn force_refresh(
        &self,
        id: CredentialId,
        cred: &UpstreamCredentials,
    ) -> Result<UpstreamCredentials, CredentialError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let row = self
            .store
            .get_upstream(id)
            .await?
            .ok_or(CredentialError::NotFound(id))?;
        let current: UpstreamCredentials = serde_json::from_value(row.credentials)
            .map_err(|e| CredentialError::RefreshResponseInvalid(e.to_string()))?;
        // Another waiter may have already refreshed past what the caller
        // observed; only skip the network round-trip if the access token on
        // record has actually changed since.
        if current.access_token != cred.access_token {
            return Ok(current);
        }

        let refreshed = self.refresh(id, &current).await?;
        self.store
            .update_upstream_credentials(
                id,
                serde_json::to_value(&refreshed).unwrap_or_default(),
            )
            .await?;
        self.pool.update_credential(id, refreshed.clone()).await;
        self.pool
            .events()
            .emit(Event::Credential(CredentialEvent::TokenRefreshed {
                at: std::time::SystemTime::now(),
                credential_id: id,
            }))
            .await;
        Ok(refreshed)
    }

    async fn refresh(
        &self,
        id: CredentialId,
        cred: &UpstreamCredentials,
    ) -> Result<UpstreamCredentials, CredentialError> {
        let result = match cred.auth_method {
            AuthMethod::Social => self.refresh_social(cred).await,
            AuthMethod::BuilderId | AuthMethod::IdC => self.refresh_idc(cred).await,
        };
        if let Err(err) = &result {
            self.pool
                .events()
                .emit(Event::Credential(CredentialEvent::RefreshFailed {
                    at: std::time::SystemTime::now(),
                    credential_id: id,
                    error: err.to_string(),
                }))
                .await;
        }
        result
    }

    async fn refresh_social(
        &self,
        cred: &UpstreamCredentials,
    ) -> Result<UpstreamCredentials, CredentialError> {
        let body = serde_json::json!({ "refreshToken": cred.refresh_token });
        let resp = self
            .client
            .post(SOCIAL_REFRESH_URL)
            .json(&body)
            .send()
            .await
            .map_err(|e| CredentialError::RefreshRequestFailed(e.to_string()))?;
        let parsed: SocialRefreshResponse = resp
            .json()
            .await
            .map_err(|e| CredentialError::RefreshResponseInvalid(e.to_string()))?;
        Ok(apply_refresh(cred, parsed.access_token, parsed.refresh_token, parsed.expires_in))
    }

    async fn refresh_idc(
        &self,
        cred: &UpstreamCredentials,
    ) -> Result<UpstreamCredentials, CredentialError> {
        let client_id = cred
            .client_id
            .clone()
            .ok_or_else(|| CredentialError::MissingClientCredentials(0))?;
        let client_secret = cred
            .client_secret
            .clone()
            .ok_or_else(|| CredentialError::MissingClientCredentials(0))?;
        let url = IDC_REFRESH_URL_TEMPLATE.replace("{region}", &cred.region);
        let body = serde_json::json!({
            "grantType": "refresh_token",
            "refreshToken": cred.refresh_token,
            "clientId": client_id,
            "clientSecret": client_secret,
        });
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CredentialError::RefreshRequestFailed(e.to_string()))?;
        let parsed: IdcRefreshResponse = resp
            .json()
            .await
            .map_err(|e| CredentialError::RefreshResponseInvalid(e.to_string()))?;
        Ok(apply_refresh(cred, parsed.access_token, parsed.refresh_token, parsed.expires_in))
    }
}

fn apply_refresh(
    cred: &UpstreamCredentials,
    access_token: String,
    refresh_token: Option<String>,
    expires_in_secs: i64,
) -> UpstreamCredentials {
    let mut next = cred.clone();
    next.access_token = access_token;
    if let Some(refresh_token) = refresh_token {
        next.refresh_token = refresh_token;
    }
    next.expires_at = now_unix_ms() + expires_in_secs * 1000;
    next
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_refresh_keeps_old_refresh_token_when_absent() {
        let cred = UpstreamCredentials {
            access_token: "old".into(),
            refresh_token: "keep-me".into(),
            expires_at: 0,
            auth_method: AuthMethod::Social,
            region: "us-east-1".into(),
            start_url: None,
            sso_region: None,
            profile_arn: None,
            client_id: None,
            client_secret: None,
        };
        let next = apply_refresh(&cred, "new".into(), None, 3600);
        assert_eq!(next.access_token, "new");
        assert_eq!(next.refresh_token, "keep-me");
        assert!(next.expires_at > 0);
    }
}
