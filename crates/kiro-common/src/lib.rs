use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config field {0}: {1}")]
    InvalidField(&'static str, String),
}

/// Upstream pool ordering policy (spec §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStrategy {
    Lru,
    RoundRobin,
    LeastUsage,
    MostUsage,
    OldestFirst,
}

impl Default for ProviderStrategy {
    fn default() -> Self {
        Self::Lru
    }
}

impl std::str::FromStr for ProviderStrategy {
    type Err = GlobalConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lru" => Ok(Self::Lru),
            "round_robin" => Ok(Self::RoundRobin),
            "least_usage" => Ok(Self::LeastUsage),
            "most_usage" => Ok(Self::MostUsage),
            "oldest_first" => Ok(Self::OldestFirst),
            other => Err(GlobalConfigError::InvalidField(
                "provider_strategy",
                other.to_string(),
            )),
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Whether to redact sensitive fields in emitted events/logs.
    pub event_redact_sensitive: bool,
    /// Admin session token lifetime.
    pub session_expire_hours: u32,
    /// Consecutive upstream failures before an upstream is marked unhealthy.
    pub max_error_count: u32,
    pub health_check_interval_minutes: u32,
    pub request_max_retries: u32,
    pub request_base_delay_ms: u64,
    pub provider_strategy: ProviderStrategy,
    pub usage_sync_interval_minutes: u32,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub session_expire_hours: Option<u32>,
    pub max_error_count: Option<u32>,
    pub health_check_interval_minutes: Option<u32>,
    pub request_max_retries: Option<u32>,
    pub request_base_delay_ms: Option<u64>,
    pub provider_strategy: Option<ProviderStrategy>,
    pub usage_sync_interval_minutes: Option<u32>,
}

macro_rules! overlay_field {
    ($self:ident, $other:ident, $field:ident) => {
        if $other.$field.is_some() {
            $self.$field = $other.$field;
        }
    };
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        overlay_field!(self, other, host);
        overlay_field!(self, other, port);
        overlay_field!(self, other, admin_key_hash);
        overlay_field!(self, other, proxy);
        overlay_field!(self, other, dsn);
        overlay_field!(self, other, event_redact_sensitive);
        overlay_field!(self, other, session_expire_hours);
        overlay_field!(self, other, max_error_count);
        overlay_field!(self, other, health_check_interval_minutes);
        overlay_field!(self, other, request_max_retries);
        overlay_field!(self, other, request_base_delay_ms);
        overlay_field!(self, other, provider_strategy);
        overlay_field!(self, other, usage_sync_interval_minutes);
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            proxy: self.proxy,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            session_expire_hours: self.session_expire_hours.unwrap_or(24),
            max_error_count: self.max_error_count.unwrap_or(3),
            health_check_interval_minutes: self.health_check_interval_minutes.unwrap_or(10),
            request_max_retries: self.request_max_retries.unwrap_or(3),
            request_base_delay_ms: self.request_base_delay_ms.unwrap_or(500),
            provider_strategy: self.provider_strategy.unwrap_or_default(),
            usage_sync_interval_minutes: self.usage_sync_interval_minutes.unwrap_or(10),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            dsn: Some(value.dsn),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            session_expire_hours: Some(value.session_expire_hours),
            max_error_count: Some(value.max_error_count),
            health_check_interval_minutes: Some(value.health_check_interval_minutes),
            request_max_retries: Some(value.request_max_retries),
            request_base_delay_ms: Some(value.request_base_delay_ms),
            provider_strategy: Some(value.provider_strategy),
            usage_sync_interval_minutes: Some(value.usage_sync_interval_minutes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_patch() {
        let mut base = GlobalConfigPatch {
            host: Some("0.0.0.0".to_string()),
            port: Some(8787),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            port: Some(9000),
            ..Default::default()
        });
        assert_eq!(base.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(base.port, Some(9000));
    }

    #[test]
    fn into_config_requires_admin_key_hash() {
        let patch = GlobalConfigPatch {
            dsn: Some("sqlite://x.db".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(GlobalConfigError::MissingField("admin_key_hash"))
        ));
    }

    #[test]
    fn provider_strategy_parses_known_values() {
        assert_eq!(
            "least_usage".parse::<ProviderStrategy>().unwrap(),
            ProviderStrategy::LeastUsage
        );
        assert!("bogus".parse::<ProviderStrategy>().is_err());
    }
}
