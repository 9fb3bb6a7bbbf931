//! Pool Selector: picks one upstream per request, records outcomes, and
//! retries non-stream requests across distinct upstreams (spec §4.G).
//!
//! Grounded on `CredentialPool::acquire`'s eligibility filtering plus
//! `unavailable_queue.rs`'s recovery discipline, widened with the explicit
//! strategy orderings `Store::select_eligible_upstreams` already applies —
//! the pool here just narrows that ordered list down to what's actually
//! available in memory. `RoundRobin`'s rotating cursor lives here, since
//! `Store::select_eligible_upstreams` is a stateless per-call query and
//! cannot itself rotate.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kiro_common::ProviderStrategy;
use kiro_store::Store;

use crate::credential::{AcquireError, CredentialId, CredentialPool, UpstreamCredentials};

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("no upstream available")]
    NoUpstreamAvailable,
    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
    #[error("request failed after retries: {0}")]
    RetriesExhausted(String),
}

pub struct PoolSelector {
    store: Store,
    pool: Arc<CredentialPool>,
    strategy: ProviderStrategy,
    max_error_count: u32,
    max_retries: u32,
    base_delay: Duration,
    round_robin_cursor: AtomicUsize,
}

impl PoolSelector {
    pub fn new(
        store: Store,
        pool: Arc<CredentialPool>,
        strategy: ProviderStrategy,
        max_error_count: u32,
        max_retries: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            strategy,
            max_error_count,
            max_retries,
            base_delay,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// Returns the first eligible candidate, rotating the list first under
    /// `RoundRobin`, then applies `last_used_at`/`usage_count` bookkeeping.
    /// Falls back to the eligibility set ignoring `quota_exhausted` if the
    /// strict set is empty, per spec §4.G.
    pub async fn acquire(
        &self,
        model: Option<&str>,
    ) -> Result<(CredentialId, UpstreamCredentials), SelectorError> {
        let rows = self
            .store
            .select_eligible_upstreams(self.strategy, model)
            .await?;
        if let Some(acquired) = self.try_acquire_from(&rows, model).await? {
            return Ok(acquired);
        }

        // Nothing strictly eligible; retry ignoring quota exhaustion so a
        // momentarily-stale quota cache doesn't starve the whole pool.
        let all = self.store.list_upstreams().await?;
        let relaxed: Vec<_> = all
            .into_iter()
            .filter(|row| row.is_healthy && !row.is_disabled)
            .collect();
        self.try_acquire_from(&relaxed, model)
            .await?
            .ok_or(SelectorError::NoUpstreamAvailable)
    }

    async fn try_acquire_from(
        &self,
        rows: &[kiro_store::entities::upstreams::Model],
        model: Option<&str>,
    ) -> Result<Option<(CredentialId, UpstreamCredentials)>, SelectorError> {
        if rows.is_empty() {
            return Ok(None);
        }
        let candidates = self.order_candidates(rows);
        match self.pool.acquire(&candidates, model).await {
            Ok((id, cred)) => {
                self.store.record_upstream_usage(id).await?;
                Ok(Some((id, cred)))
            }
            Err(AcquireError::NoEligibleUpstreams) => Ok(None),
        }
    }

    fn order_candidates(&self, rows: &[kiro_store::entities::upstreams::Model]) -> Vec<CredentialId> {
        let ids: Vec<CredentialId> = rows.iter().map(|row| row.id).collect();
        if self.strategy != ProviderStrategy::RoundRobin || ids.is_empty() {
            return ids;
        }
        let offset = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % ids.len();
        let mut rotated = Vec::with_capacity(ids.len());
        rotated.extend_from_slice(&ids[offset..]);
        rotated.extend_from_slice(&ids[..offset]);
        rotated
    }

    pub async fn report_success(&self, id: CredentialId) -> Result<(), SelectorError> {
        self.store.mark_upstream_healthy(id, false).await?;
        Ok(())
    }

    pub async fn report_error(&self, id: CredentialId, message: &str) -> Result<(), SelectorError> {
        self.store
            .mark_upstream_unhealthy(id, message, self.max_error_count)
            .await?;
        Ok(())
    }

    /// Drives non-stream requests across up to `max_retries` distinct
    /// upstream acquisitions with exponential backoff between attempts.
    /// Streaming requests must not use this: once bytes flow, a failure is
    /// reported and propagated without retry (spec §4.F).
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        model: Option<&str>,
        mut request: F,
    ) -> Result<T, SelectorError>
    where
        F: FnMut(CredentialId, UpstreamCredentials) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let mut last_error = String::from("no attempts made");
        for attempt in 0..self.max_retries.max(1) {
            let (id, cred) = self.acquire(model).await?;
            match request(id, cred).await {
                Ok(value) => {
                    self.report_success(id).await?;
                    return Ok(value);
                }
                Err(message) => {
                    self.report_error(id, &message).await?;
                    last_error = message;
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(self.base_delay * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        Err(SelectorError::RetriesExhausted(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cursor_wraps() {
        let cursor = AtomicUsize::new(0);
        let len = 3usize;
        let offsets: Vec<usize> = (0..5)
            .map(|_| cursor.fetch_add(1, Ordering::Relaxed) % len)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 0, 1]);
    }
}
