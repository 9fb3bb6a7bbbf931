//! Inbound caller credential (spec §3 "APIKey").

use sea_orm::entity::prelude::*;
use time::Date;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Salted digest of the plaintext key; the plaintext is never stored.
    #[sea_orm(unique_key = "api_key_hash")]
    pub key_hash: String,
    /// First few characters of the plaintext, shown in admin listings.
    pub display_prefix: String,
    pub name: String,
    pub user_id: Option<i64>,
    /// -1 means unlimited.
    pub daily_limit: i64,
    pub today_usage: i64,
    pub total_usage: i64,
    pub last_reset_date: Date,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
