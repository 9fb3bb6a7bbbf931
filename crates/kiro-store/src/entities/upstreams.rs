//! One pooled Kiro identity (spec §3 "Upstream").

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upstreams")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "upstream_uuid")]
    pub uuid: String,
    pub display_name: String,
    pub region: String,
    /// `{accessToken,refreshToken,expiresAt,authMethod,region,startUrl,ssoRegion,profileArn?,clientId?,clientSecret?}`.
    pub credentials: Json,
    pub account_email: Option<String>,
    /// `FREE` | `PRO` | `UNKNOWN`.
    pub account_type: String,
    /// Null means all models are allowed.
    pub allowed_models: Option<Json>,
    pub is_healthy: bool,
    pub is_disabled: bool,
    pub error_count: i32,
    pub last_error_time: Option<OffsetDateTime>,
    pub last_error_message: Option<String>,
    pub last_used_at: Option<OffsetDateTime>,
    pub usage_count: i64,
    pub check_health: bool,
    pub quota_used: Option<i64>,
    pub quota_limit: Option<i64>,
    pub quota_percent: Option<f64>,
    pub quota_exhausted: bool,
    pub cached_usage_data: Option<Json>,
    pub last_usage_sync: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
