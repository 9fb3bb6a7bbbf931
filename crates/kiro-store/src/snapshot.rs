use kiro_common::GlobalConfig;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct GlobalConfigRow {
    pub id: i64,
    pub config: GlobalConfig,
    pub updated_at: OffsetDateTime,
}

/// Everything `kiro_core::AppState` needs at boot, loaded in one pass so the
/// pool and in-memory caches can be built without further DB round-trips.
#[derive(Debug, Clone)]
pub struct StorageSnapshot {
    pub global_config: Option<GlobalConfigRow>,
    pub upstreams: Vec<crate::entities::upstreams::Model>,
    pub api_keys: Vec<crate::entities::api_keys::Model>,
}
