//! Runtime state shared across the gateway (spec §4.G). Grounded on
//! `gproxy-core::state::AppState`'s `ArcSwap`-backed config cache, narrowed
//! to the single Kiro upstream family — there is no per-provider registry
//! here, just one credential pool fed from `kiro_store::Store`.

use std::sync::Arc;

use arc_swap::ArcSwap;
use kiro_common::{GlobalConfig, GlobalConfigPatch};
use kiro_credential::{CredentialManager, CredentialPool, EventHub};
use kiro_store::Store;
use kiro_upstream::KiroUpstreamClient;

use crate::error::GatewayError;

pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub store: Store,
    pub credential_pool: Arc<CredentialPool>,
    pub credential_manager: Arc<CredentialManager>,
    pub selector: Arc<kiro_credential::PoolSelector>,
    pub upstream_client: Arc<KiroUpstreamClient>,
    pub events: EventHub,
}

impl AppState {
    /// Loads every upstream row from `store` into `credential_pool` (spec
    /// §4.A "pool is seeded from storage at startup").
    pub async fn from_bootstrap(
        global: GlobalConfig,
        store: Store,
        events: EventHub,
        credential_pool: Arc<CredentialPool>,
        credential_manager: Arc<CredentialManager>,
        upstream_client: Arc<KiroUpstreamClient>,
    ) -> Result<Self, GatewayError> {
        let rows = store.list_upstreams().await?;
        for row in &rows {
            if row.is_disabled {
                continue;
            }
            let cred: kiro_credential::UpstreamCredentials = serde_json::from_value(row.credentials.clone())
                .map_err(|e| GatewayError::InvalidRequest(format!("decode credentials for upstream {}: {e}", row.id)))?;
            credential_pool.insert(row.id, cred).await;
        }

        let selector = Arc::new(kiro_credential::PoolSelector::new(
            store.clone(),
            credential_pool.clone(),
            global.provider_strategy,
            global.max_error_count,
            global.request_max_retries,
            std::time::Duration::from_millis(global.request_base_delay_ms),
        ));

        Ok(Self {
            global: ArcSwap::from_pointee(global),
            store,
            credential_pool,
            credential_manager,
            selector,
            upstream_client,
            events,
        })
    }

    pub fn apply_global_config_patch(&self, patch: GlobalConfigPatch) -> anyhow::Result<GlobalConfig> {
        let current = self.global.load().as_ref().clone();
        let mut merged = GlobalConfigPatch::from(current);
        merged.overlay(patch);
        let next = merged.into_config()?;
        self.global.store(Arc::new(next.clone()));
        Ok(next)
    }
}
