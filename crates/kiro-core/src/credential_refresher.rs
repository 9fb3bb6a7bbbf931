//! Adapts `CredentialManager::force_refresh` to the narrow trait
//! `kiro-upstream` expects, so that crate never depends on the manager
//! directly (spec §9 "Upstream Client takes a refresh-now callback, not the
//! manager"). Shared by the Proxy Engine and the scheduled reconcilers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use kiro_credential::{CredentialManager, UpstreamCredentials};
use kiro_upstream::{CredentialRefresher, UpstreamError};

pub(crate) struct ManagerRefresher {
    pub(crate) manager: Arc<CredentialManager>,
}

impl CredentialRefresher for ManagerRefresher {
    fn force_refresh<'a>(
        &'a self,
        upstream_id: i64,
        cred: &'a UpstreamCredentials,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamCredentials, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            self.manager
                .force_refresh(upstream_id, cred)
                .await
                .map_err(|e| UpstreamError::CredentialRefresh(e.to_string()))
        })
    }
}
