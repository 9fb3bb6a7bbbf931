//! Quota Reconciler (§4.H) and Health Checker (§4.I): two independent
//! `tokio::time::interval` loops seeded at startup, each guarded by an
//! `AtomicBool` so a slow run never overlaps its own next tick (spec §5
//! "skip scheduling when a previous run is still in flight"). No teacher
//! file runs a scheduled reconciler; the loop shape is grounded on the
//! proactive-refresh background task pattern common across the pack (spawn
//! + `tokio::time::interval` + skip-if-running guard).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kiro_credential::UpstreamCredentials;
use kiro_protocol::canonical::{CanonicalMessage, CanonicalRequest, CanonicalRole};
use kiro_store::entities::upstreams::Model as UpstreamRow;
use serde_json::Value;
use tracing::{info, warn};

use crate::credential_refresher::ManagerRefresher;
use crate::state::AppState;

const HEALTH_PROBE_MODEL: &str = "claude-haiku-4-5";
const HEALTH_PROBE_MAX_TOKENS: u32 = 10;
const UNHEALTHY_RECOVERY_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Spawns both reconcilers; returns immediately, the loops run for the life
/// of the process.
pub fn spawn(state: Arc<AppState>) {
    spawn_quota_reconciler(state.clone());
    spawn_health_checker(state.clone());
    spawn_unhealthy_recovery(state);
}

fn spawn_quota_reconciler(state: Arc<AppState>) {
    let running = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            let interval_minutes = state.global.load().usage_sync_interval_minutes.max(1);
            tokio::time::sleep(Duration::from_secs(interval_minutes as u64 * 60)).await;
            if running.swap(true, Ordering::SeqCst) {
                continue;
            }
            if let Err(err) = reconcile_quota(&state, interval_minutes).await {
                warn!(error = %err, "quota reconciler run failed");
            }
            running.store(false, Ordering::SeqCst);
        }
    });
}

async fn reconcile_quota(state: &Arc<AppState>, interval_minutes: u32) -> Result<(), String> {
    let rows = state.store.list_upstreams().await.map_err(|e| e.to_string())?;
    let stale_after = time::OffsetDateTime::now_utc() - time::Duration::minutes(interval_minutes as i64);
    let refresher = ManagerRefresher { manager: state.credential_manager.clone() };

    for row in rows {
        if row.is_disabled {
            continue;
        }
        let due = match row.last_usage_sync {
            None => true,
            Some(last) => last < stale_after,
        };
        if !due {
            continue;
        }
        let Some(cred) = decode_credentials(&row) else { continue };
        match state
            .upstream_client
            .get_usage(row.id, &row.uuid, cred, &refresher)
            .await
        {
            Ok(raw) => {
                let usage = normalize_usage(&raw);
                if let Err(err) = state
                    .store
                    .update_upstream_quota(row.id, usage.used, usage.limit, usage.percent, usage.exhausted, Some(raw))
                    .await
                {
                    warn!(upstream = row.id, error = %err, "failed to persist quota reconciliation");
                }
            }
            Err(err) => warn!(upstream = row.id, error = %err, "quota fetch failed"),
        }
    }
    Ok(())
}

fn spawn_health_checker(state: Arc<AppState>) {
    let running = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            let interval_minutes = state.global.load().health_check_interval_minutes.max(1);
            tokio::time::sleep(Duration::from_secs(interval_minutes as u64 * 60)).await;
            if running.swap(true, Ordering::SeqCst) {
                continue;
            }
            let rows = match state.store.list_upstreams().await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(error = %err, "health checker failed to list upstreams");
                    running.store(false, Ordering::SeqCst);
                    continue;
                }
            };
            for row in rows {
                if row.is_disabled || !row.check_health {
                    continue;
                }
                probe_one(&state, row).await;
            }
            running.store(false, Ordering::SeqCst);
        }
    });
}

/// Every 30 minutes, independent of `health_check_interval_minutes`, retry
/// currently-unhealthy upstreams with the same minimal probe (spec §4.I
/// "separate slower loop").
fn spawn_unhealthy_recovery(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(UNHEALTHY_RECOVERY_INTERVAL).await;
            let rows = match state.store.list_upstreams().await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(error = %err, "unhealthy recovery failed to list upstreams");
                    continue;
                }
            };
            for row in rows {
                if row.is_disabled || row.is_healthy {
                    continue;
                }
                probe_one(&state, row).await;
            }
        }
    });
}

async fn probe_one(state: &Arc<AppState>, row: UpstreamRow) {
    let upstream_id = row.id;
    let max_error_count = state.global.load().max_error_count;
    let Some(cred) = decode_credentials(&row) else { return };
    let refresher = ManagerRefresher { manager: state.credential_manager.clone() };
    let req = CanonicalRequest {
        model: HEALTH_PROBE_MODEL.to_string(),
        messages: vec![CanonicalMessage::text(CanonicalRole::User, "Hi")],
        max_tokens: Some(HEALTH_PROBE_MAX_TOKENS),
        stream: false,
        ..Default::default()
    };

    let outcome = state
        .upstream_client
        .call(upstream_id, &row.uuid, cred, &refresher, &req)
        .await;

    match outcome {
        Ok(result) if !result.text.is_empty() => {
            if let Err(err) = state.store.mark_upstream_healthy(upstream_id, false).await {
                warn!(upstream = upstream_id, error = %err, "failed to record healthy probe");
            } else {
                info!(upstream = upstream_id, "health probe succeeded");
            }
        }
        Ok(_) => {
            let _ = state.store.mark_upstream_unhealthy(upstream_id, "empty health probe response", max_error_count).await;
        }
        Err(err) => {
            let _ = state.store.mark_upstream_unhealthy(upstream_id, &err.to_string(), max_error_count).await;
        }
    }
}

fn decode_credentials(row: &UpstreamRow) -> Option<UpstreamCredentials> {
    match serde_json::from_value(row.credentials.clone()) {
        Ok(cred) => Some(cred),
        Err(err) => {
            warn!(upstream = row.id, error = %err, "failed to decode stored credentials");
            None
        }
    }
}

struct NormalizedUsage {
    used: i64,
    limit: i64,
    percent: f64,
    exhausted: bool,
}

/// Sums base + free-trial + active bonus entries out of `getUsageLimits`'s
/// `usageBreakdownList` (spec §4.H "sum base + free-trial + active
/// bonuses"). The upstream response schema is undocumented; this walks the
/// shape observed for the CodeWhisperer quota endpoint and falls back to
/// top-level `currentUsage`/`usageLimit` fields if the breakdown is absent —
/// a best-effort mapping, noted as such in DESIGN.md.
fn normalize_usage(raw: &Value) -> NormalizedUsage {
    let breakdown = raw.get("usageBreakdownList").and_then(Value::as_array);
    let (used, limit) = match breakdown {
        Some(items) if !items.is_empty() => items.iter().fold((0i64, 0i64), |(used, limit), item| {
            let item_used = item.get("currentUsage").and_then(Value::as_i64).unwrap_or(0);
            let item_limit = item
                .get("usageLimitWithPrecision")
                .or_else(|| item.get("usageLimit"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            (used + item_used, limit + item_limit)
        }),
        _ => (
            raw.get("currentUsage").and_then(Value::as_i64).unwrap_or(0),
            raw.get("usageLimit").and_then(Value::as_i64).unwrap_or(0),
        ),
    };
    let percent = if limit > 0 { (used as f64 / limit as f64) * 100.0 } else { 0.0 };
    let exhausted = limit > 0 && used >= limit;
    NormalizedUsage { used, limit, percent, exhausted }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_breakdown_sum() {
        let raw = serde_json::json!({
            "usageBreakdownList": [
                {"currentUsage": 10, "usageLimitWithPrecision": 100},
                {"currentUsage": 5, "usageLimitWithPrecision": 50},
            ]
        });
        let usage = normalize_usage(&raw);
        assert_eq!(usage.used, 15);
        assert_eq!(usage.limit, 150);
        assert!(!usage.exhausted);
    }

    #[test]
    fn falls_back_to_top_level_fields_when_no_breakdown() {
        let raw = serde_json::json!({"currentUsage": 100, "usageLimit": 100});
        let usage = normalize_usage(&raw);
        assert!(usage.exhausted);
    }
}
