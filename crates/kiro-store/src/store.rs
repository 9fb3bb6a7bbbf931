//! Relational storage facade (spec §3/§4.A).
//!
//! A concrete struct, not a boxed trait — mirrors the teacher's canonical
//! `TrafficStorage` shape rather than the stale `dyn Storage` trait that
//! never got wired into a binary.

use kiro_common::GlobalConfig;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue, DatabaseConnection, DbErr, QueryOrder, Schema};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime};

use crate::db::connect_shared;
use crate::entities;
use crate::snapshot::{GlobalConfigRow, StorageSnapshot};

pub const API_KEY_PREFIX: &str = "kp_";
const API_KEY_RANDOM_LEN: usize = 32;
const OAUTH_SESSION_TTL: time::Duration = time::Duration::minutes(10);

#[derive(Debug, Clone)]
pub struct NewUpstreamInput {
    pub uuid: String,
    pub display_name: String,
    pub region: String,
    pub credentials: Json,
    pub account_email: Option<String>,
    pub account_type: String,
    pub allowed_models: Option<Json>,
    pub check_health: bool,
}

#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, DbErr> {
        let db = connect_shared(database_url).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ApiKeys)
            .register(entities::Upstreams)
            .register(entities::OAuthSessions)
            .register(entities::GlobalConfig)
            .sync(&self.db)
            .await
    }

    pub async fn health(&self) -> Result<(), DbErr> {
        entities::GlobalConfig::find()
            .order_by_asc(entities::global_config::Column::Id)
            .one(&self.db)
            .await?;
        Ok(())
    }

    pub async fn load_snapshot(&self) -> Result<StorageSnapshot, DbErr> {
        let global_config = self.get_global_config_row().await?;
        let upstreams = entities::Upstreams::find().all(&self.db).await?;
        let api_keys = entities::ApiKeys::find().all(&self.db).await?;
        Ok(StorageSnapshot {
            global_config,
            upstreams,
            api_keys,
        })
    }

    // ---- Global config ----------------------------------------------

    pub async fn get_global_config_row(&self) -> Result<Option<GlobalConfigRow>, DbErr> {
        let row = entities::GlobalConfig::find()
            .order_by_asc(entities::global_config::Column::Id)
            .one(&self.db)
            .await?;
        Ok(row.and_then(|r| {
            serde_json::from_value::<GlobalConfig>(r.config_json)
                .ok()
                .map(|config| GlobalConfigRow {
                    id: r.id,
                    config,
                    updated_at: r.updated_at,
                })
        }))
    }

    pub async fn upsert_global_config(&self, config: &GlobalConfig) -> Result<(), DbErr> {
        use entities::global_config::Column;
        let now = OffsetDateTime::now_utc();
        let active = entities::global_config::ActiveModel {
            id: ActiveValue::Set(1),
            config_json: ActiveValue::Set(serde_json::to_value(config).unwrap_or_default()),
            updated_at: ActiveValue::Set(now),
        };
        entities::GlobalConfig::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([Column::ConfigJson, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ---- API keys -----------------------------------------------------

    /// Hashes `plaintext` with SHA-256; the digest, not the plaintext, is
    /// what gets stored and compared.
    pub fn hash_api_key(plaintext: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(plaintext.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Generates a new `kp_`-prefixed plaintext key. The caller is
    /// responsible for returning it to the user exactly once — it is never
    /// recoverable after this call returns.
    pub fn generate_api_key_plaintext() -> String {
        use rand::Rng;
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut rng = rand::rng();
        let suffix: String = (0..API_KEY_RANDOM_LEN)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        format!("{API_KEY_PREFIX}{suffix}")
    }

    pub async fn insert_api_key(
        &self,
        name: String,
        user_id: Option<i64>,
        daily_limit: i64,
    ) -> Result<(entities::api_keys::Model, String), DbErr> {
        let plaintext = Self::generate_api_key_plaintext();
        let key_hash = Self::hash_api_key(&plaintext);
        let display_prefix = plaintext.chars().take(10).collect::<String>();
        let now = OffsetDateTime::now_utc();
        let today = now.date();

        let active = entities::api_keys::ActiveModel {
            id: ActiveValue::NotSet,
            key_hash: ActiveValue::Set(key_hash),
            display_prefix: ActiveValue::Set(display_prefix),
            name: ActiveValue::Set(name),
            user_id: ActiveValue::Set(user_id),
            daily_limit: ActiveValue::Set(daily_limit),
            today_usage: ActiveValue::Set(0),
            total_usage: ActiveValue::Set(0),
            last_reset_date: ActiveValue::Set(today),
            is_active: ActiveValue::Set(true),
            created_at: ActiveValue::Set(now),
            last_used_at: ActiveValue::Set(None),
        };
        let result = entities::ApiKeys::insert(active).exec(&self.db).await?;
        let model = entities::ApiKeys::find_by_id(result.last_insert_id)
            .one(&self.db)
            .await?
            .ok_or(DbErr::RecordNotFound("api_keys".to_string()))?;
        Ok((model, plaintext))
    }

    pub async fn list_api_keys(&self) -> Result<Vec<entities::api_keys::Model>, DbErr> {
        entities::ApiKeys::find().all(&self.db).await
    }

    pub async fn delete_api_key(&self, id: i64) -> Result<(), DbErr> {
        entities::ApiKeys::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    pub async fn set_api_key_active(&self, id: i64, is_active: bool) -> Result<(), DbErr> {
        let active = entities::api_keys::ActiveModel {
            id: ActiveValue::Set(id),
            is_active: ActiveValue::Set(is_active),
            ..Default::default()
        };
        entities::ApiKeys::update(active).exec(&self.db).await?;
        Ok(())
    }

    /// Rejects keys without the fixed prefix, enforces daily rollover, and
    /// reports whether the daily limit has already been exceeded (spec §4.A).
    pub async fn validate_api_key(
        &self,
        plaintext: &str,
    ) -> Result<Option<(entities::api_keys::Model, bool)>, DbErr> {
        if !plaintext.starts_with(API_KEY_PREFIX) {
            return Ok(None);
        }
        let key_hash = Self::hash_api_key(plaintext);
        let Some(mut row) = entities::ApiKeys::find()
            .filter(entities::api_keys::Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        if !row.is_active {
            return Ok(None);
        }

        let now = OffsetDateTime::now_utc();
        let today: Date = now.date();
        if row.last_reset_date != today {
            row.today_usage = 0;
            row.last_reset_date = today;
            let active = entities::api_keys::ActiveModel {
                id: ActiveValue::Set(row.id),
                today_usage: ActiveValue::Set(0),
                last_reset_date: ActiveValue::Set(today),
                ..Default::default()
            };
            entities::ApiKeys::update(active).exec(&self.db).await?;
        }

        let exceeded = row.daily_limit > 0 && row.today_usage >= row.daily_limit;
        Ok(Some((row, exceeded)))
    }

    pub async fn record_api_key_usage(&self, id: i64) -> Result<(), DbErr> {
        use sea_orm::sea_query::Expr;
        entities::ApiKeys::update_many()
            .col_expr(
                entities::api_keys::Column::TodayUsage,
                Expr::col(entities::api_keys::Column::TodayUsage).add(1),
            )
            .col_expr(
                entities::api_keys::Column::TotalUsage,
                Expr::col(entities::api_keys::Column::TotalUsage).add(1),
            )
            .col_expr(
                entities::api_keys::Column::LastUsedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(entities::api_keys::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ---- Upstreams ------------------------------------------------------

    pub async fn list_upstreams(&self) -> Result<Vec<entities::upstreams::Model>, DbErr> {
        entities::Upstreams::find().all(&self.db).await
    }

    pub async fn get_upstream(&self, id: i64) -> Result<Option<entities::upstreams::Model>, DbErr> {
        entities::Upstreams::find_by_id(id).one(&self.db).await
    }

    pub async fn insert_upstream(
        &self,
        input: NewUpstreamInput,
    ) -> Result<entities::upstreams::Model, DbErr> {
        let now = OffsetDateTime::now_utc();
        let active = entities::upstreams::ActiveModel {
            id: ActiveValue::NotSet,
            uuid: ActiveValue::Set(input.uuid),
            display_name: ActiveValue::Set(input.display_name),
            region: ActiveValue::Set(input.region),
            credentials: ActiveValue::Set(input.credentials),
            account_email: ActiveValue::Set(input.account_email),
            account_type: ActiveValue::Set(input.account_type),
            allowed_models: ActiveValue::Set(input.allowed_models),
            is_healthy: ActiveValue::Set(true),
            is_disabled: ActiveValue::Set(false),
            error_count: ActiveValue::Set(0),
            last_error_time: ActiveValue::Set(None),
            last_error_message: ActiveValue::Set(None),
            last_used_at: ActiveValue::Set(None),
            usage_count: ActiveValue::Set(0),
            check_health: ActiveValue::Set(input.check_health),
            quota_used: ActiveValue::Set(None),
            quota_limit: ActiveValue::Set(None),
            quota_percent: ActiveValue::Set(None),
            quota_exhausted: ActiveValue::Set(false),
            cached_usage_data: ActiveValue::Set(None),
            last_usage_sync: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let result = entities::Upstreams::insert(active).exec(&self.db).await?;
        entities::Upstreams::find_by_id(result.last_insert_id)
            .one(&self.db)
            .await?
            .ok_or(DbErr::RecordNotFound("upstreams".to_string()))
    }

    pub async fn update_upstream_credentials(
        &self,
        id: i64,
        credentials: Json,
    ) -> Result<(), DbErr> {
        let active = entities::upstreams::ActiveModel {
            id: ActiveValue::Set(id),
            credentials: ActiveValue::Set(credentials),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::Upstreams::update(active).exec(&self.db).await?;
        Ok(())
    }

    pub async fn set_upstream_disabled(&self, id: i64, is_disabled: bool) -> Result<(), DbErr> {
        let active = entities::upstreams::ActiveModel {
            id: ActiveValue::Set(id),
            is_disabled: ActiveValue::Set(is_disabled),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::Upstreams::update(active).exec(&self.db).await?;
        Ok(())
    }

    pub async fn delete_upstream(&self, id: i64) -> Result<(), DbErr> {
        entities::Upstreams::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    pub async fn update_upstream_quota(
        &self,
        id: i64,
        used: i64,
        limit: i64,
        percent: f64,
        exhausted: bool,
        cached_usage_data: Option<Json>,
    ) -> Result<(), DbErr> {
        let active = entities::upstreams::ActiveModel {
            id: ActiveValue::Set(id),
            quota_used: ActiveValue::Set(Some(used)),
            quota_limit: ActiveValue::Set(Some(limit)),
            quota_percent: ActiveValue::Set(Some(percent)),
            quota_exhausted: ActiveValue::Set(exhausted),
            cached_usage_data: ActiveValue::Set(cached_usage_data),
            last_usage_sync: ActiveValue::Set(Some(OffsetDateTime::now_utc())),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::Upstreams::update(active).exec(&self.db).await?;
        Ok(())
    }

    pub async fn record_upstream_usage(&self, id: i64) -> Result<(), DbErr> {
        use sea_orm::sea_query::Expr;
        entities::Upstreams::update_many()
            .col_expr(
                entities::upstreams::Column::UsageCount,
                Expr::col(entities::upstreams::Column::UsageCount).add(1),
            )
            .col_expr(
                entities::upstreams::Column::LastUsedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(entities::upstreams::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Increments `error_count`; flips `is_healthy` false once it reaches
    /// `max_error_count` (spec §4.A/§3 invariant).
    pub async fn mark_upstream_unhealthy(
        &self,
        id: i64,
        err: &str,
        max_error_count: u32,
    ) -> Result<(), DbErr> {
        let Some(row) = entities::Upstreams::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let error_count = row.error_count + 1;
        let active = entities::upstreams::ActiveModel {
            id: ActiveValue::Set(id),
            error_count: ActiveValue::Set(error_count),
            last_error_time: ActiveValue::Set(Some(OffsetDateTime::now_utc())),
            last_error_message: ActiveValue::Set(Some(err.to_string())),
            is_healthy: ActiveValue::Set((error_count as u32) < max_error_count),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::Upstreams::update(active).exec(&self.db).await?;
        Ok(())
    }

    /// Resets `error_count` and clears error fields; `reset_usage` additionally
    /// zeroes `usage_count` (spec §4.A).
    pub async fn mark_upstream_healthy(&self, id: i64, reset_usage: bool) -> Result<(), DbErr> {
        let active = entities::upstreams::ActiveModel {
            id: ActiveValue::Set(id),
            error_count: ActiveValue::Set(0),
            last_error_time: ActiveValue::Set(None),
            last_error_message: ActiveValue::Set(None),
            is_healthy: ActiveValue::Set(true),
            usage_count: if reset_usage {
                ActiveValue::Set(0)
            } else {
                ActiveValue::NotSet
            },
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::Upstreams::update(active).exec(&self.db).await?;
        Ok(())
    }

    /// Eligibility filter (`is_healthy ∧ ¬is_disabled ∧ ¬exhausted`) plus an
    /// optional `model` membership check against `allowed_models`
    /// (fail-open on parse error, spec §3 invariant), ordered per `strategy`.
    /// `RoundRobin`'s rotating cursor lives in the Pool Selector, not here —
    /// this returns a stable id-ordered candidate list for it to rotate over.
    pub async fn select_eligible_upstreams(
        &self,
        strategy: kiro_common::ProviderStrategy,
        model: Option<&str>,
    ) -> Result<Vec<entities::upstreams::Model>, DbErr> {
        use entities::upstreams::Column;
        use kiro_common::ProviderStrategy;

        let query = entities::Upstreams::find()
            .filter(Column::IsHealthy.eq(true))
            .filter(Column::IsDisabled.eq(false))
            .filter(Column::QuotaExhausted.eq(false));

        let query = match strategy {
            ProviderStrategy::Lru => query.order_by_asc(Column::LastUsedAt),
            ProviderStrategy::RoundRobin => query.order_by_asc(Column::Id),
            ProviderStrategy::LeastUsage => query.order_by_asc(Column::UsageCount),
            ProviderStrategy::MostUsage => query.order_by_desc(Column::UsageCount),
            ProviderStrategy::OldestFirst => query.order_by_asc(Column::CreatedAt),
        };

        let rows = query.all(&self.db).await?;
        Ok(rows
            .into_iter()
            .filter(|row| model_allowed(row, model))
            .collect())
    }

    // ---- OAuth sessions ---------------------------------------------------

    pub async fn create_oauth_session(
        &self,
        id: String,
        kind: String,
        provider: Option<String>,
        region: String,
        payload: Json,
    ) -> Result<entities::oauth_sessions::Model, DbErr> {
        let now = OffsetDateTime::now_utc();
        let active = entities::oauth_sessions::ActiveModel {
            id: ActiveValue::Set(id.clone()),
            kind: ActiveValue::Set(kind),
            provider: ActiveValue::Set(provider),
            region: ActiveValue::Set(region),
            status: ActiveValue::Set("pending".to_string()),
            error: ActiveValue::Set(None),
            payload: ActiveValue::Set(payload),
            credentials: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        entities::OAuthSessions::insert(active).exec(&self.db).await?;
        entities::OAuthSessions::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(DbErr::RecordNotFound("oauth_sessions".to_string()))
    }

    pub async fn get_oauth_session(
        &self,
        id: &str,
    ) -> Result<Option<entities::oauth_sessions::Model>, DbErr> {
        entities::OAuthSessions::find_by_id(id.to_string())
            .one(&self.db)
            .await
    }

    pub async fn complete_oauth_session(
        &self,
        id: &str,
        credentials: Json,
    ) -> Result<(), DbErr> {
        let active = entities::oauth_sessions::ActiveModel {
            id: ActiveValue::Set(id.to_string()),
            status: ActiveValue::Set("completed".to_string()),
            credentials: ActiveValue::Set(Some(credentials)),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::OAuthSessions::update(active).exec(&self.db).await?;
        Ok(())
    }

    pub async fn fail_oauth_session(&self, id: &str, error: String) -> Result<(), DbErr> {
        let active = entities::oauth_sessions::ActiveModel {
            id: ActiveValue::Set(id.to_string()),
            status: ActiveValue::Set("error".to_string()),
            error: ActiveValue::Set(Some(error)),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::OAuthSessions::update(active).exec(&self.db).await?;
        Ok(())
    }

    /// Marks every session older than the 10-minute hard cap as `expired`
    /// (spec §3 "destroyed by ... expiry sweep (10 min hard cap)").
    pub async fn sweep_expired_oauth_sessions(&self) -> Result<u64, DbErr> {
        use entities::oauth_sessions::Column;
        let cutoff = OffsetDateTime::now_utc() - OAUTH_SESSION_TTL;
        let result = entities::OAuthSessions::update_many()
            .col_expr(Column::Status, sea_orm::sea_query::Expr::value("expired"))
            .filter(Column::Status.eq("pending"))
            .filter(Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

fn model_allowed(row: &entities::upstreams::Model, model: Option<&str>) -> bool {
    let Some(model) = model else { return true };
    let Some(allowed) = &row.allowed_models else {
        return true;
    };
    match allowed.as_array() {
        Some(list) => list.iter().any(|v| v.as_str() == Some(model)),
        // Malformed allowed_models is fail-open, not fail-closed (spec §3).
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.sync().await.unwrap();
        store
    }

    #[tokio::test]
    async fn validate_api_key_rejects_wrong_prefix() {
        let store = memory_store().await;
        assert!(store.validate_api_key("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn validate_api_key_reports_exceeded_limit() {
        let store = memory_store().await;
        let (key, plaintext) = store.insert_api_key("test".to_string(), None, 1).await.unwrap();
        store.record_api_key_usage(key.id).await.unwrap();
        let (_, exceeded) = store.validate_api_key(&plaintext).await.unwrap().unwrap();
        assert!(exceeded);
    }

    #[tokio::test]
    async fn mark_unhealthy_flips_at_max_error_count() {
        let store = memory_store().await;
        let upstream = store
            .insert_upstream(NewUpstreamInput {
                uuid: "u1".to_string(),
                display_name: "identity-1".to_string(),
                region: "us-east-1".to_string(),
                credentials: serde_json::json!({}),
                account_email: None,
                account_type: "FREE".to_string(),
                allowed_models: None,
                check_health: true,
            })
            .await
            .unwrap();

        store.mark_upstream_unhealthy(upstream.id, "boom", 2).await.unwrap();
        let row = entities::Upstreams::find_by_id(upstream.id)
            .one(store.connection())
            .await
            .unwrap()
            .unwrap();
        assert!(row.is_healthy);

        store.mark_upstream_unhealthy(upstream.id, "boom again", 2).await.unwrap();
        let row = entities::Upstreams::find_by_id(upstream.id)
            .one(store.connection())
            .await
            .unwrap()
            .unwrap();
        assert!(!row.is_healthy);
    }

    #[tokio::test]
    async fn select_eligible_upstreams_excludes_disabled_and_exhausted() {
        let store = memory_store().await;
        let healthy = store
            .insert_upstream(NewUpstreamInput {
                uuid: "u1".to_string(),
                display_name: "identity-1".to_string(),
                region: "us-east-1".to_string(),
                credentials: serde_json::json!({}),
                account_email: None,
                account_type: "FREE".to_string(),
                allowed_models: None,
                check_health: true,
            })
            .await
            .unwrap();
        let disabled = store
            .insert_upstream(NewUpstreamInput {
                uuid: "u2".to_string(),
                display_name: "identity-2".to_string(),
                region: "us-east-1".to_string(),
                credentials: serde_json::json!({}),
                account_email: None,
                account_type: "FREE".to_string(),
                allowed_models: None,
                check_health: true,
            })
            .await
            .unwrap();
        store.set_upstream_disabled(disabled.id, true).await.unwrap();

        let eligible = store
            .select_eligible_upstreams(kiro_common::ProviderStrategy::Lru, None)
            .await
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, healthy.id);
    }

    #[tokio::test]
    async fn select_eligible_upstreams_filters_by_allowed_models() {
        let store = memory_store().await;
        store
            .insert_upstream(NewUpstreamInput {
                uuid: "u1".to_string(),
                display_name: "identity-1".to_string(),
                region: "us-east-1".to_string(),
                credentials: serde_json::json!({}),
                account_email: None,
                account_type: "FREE".to_string(),
                allowed_models: Some(serde_json::json!(["claude-haiku-4-5"])),
                check_health: true,
            })
            .await
            .unwrap();

        let eligible = store
            .select_eligible_upstreams(kiro_common::ProviderStrategy::Lru, Some("claude-sonnet-4-5"))
            .await
            .unwrap();
        assert!(eligible.is_empty());

        let eligible = store
            .select_eligible_upstreams(kiro_common::ProviderStrategy::Lru, Some("claude-haiku-4-5"))
            .await
            .unwrap();
        assert_eq!(eligible.len(), 1);
    }
}
