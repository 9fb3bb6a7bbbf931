//! Transient in-progress interactive grant (spec §3 "OAuthSession").
//!
//! Rows are swept 10 minutes after creation regardless of status (spec §4.C),
//! so this table is small and churns constantly; it is not meant to carry
//! history.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "oauth_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// `social` | `builder-id` | `identity-center`.
    pub kind: String,
    /// `google` | `github`, only meaningful for `social`.
    pub provider: Option<String>,
    pub region: String,
    /// `pending` | `completed` | `error` | `expired` | `cancelled` | `timeout`.
    pub status: String,
    pub error: Option<String>,
    /// PKCE verifier+state+redirectUri for social; clientId/Secret+deviceCode+
    /// userCode+poll_interval+expires_at for device-code flows.
    pub payload: Json,
    pub credentials: Option<Json>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
