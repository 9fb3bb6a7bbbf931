//! Startup sequence: parse CLI/env, connect storage, merge config,
//! build the credential pool and upstream client (spec §4.A, §4.G).
//! Grounded on `gproxy-core::bootstrap::bootstrap`'s CLI-over-env-over-DB
//! merge and admin-key generation, narrowed to Kiro's single upstream
//! family (no provider registry/seeding step).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use kiro_common::{GlobalConfig, GlobalConfigPatch};
use kiro_credential::{CredentialManager, CredentialPool, EventHub, TerminalEventSink};
use kiro_store::Store;
use kiro_upstream::{KiroUpstreamClient, UpstreamClientConfig};

use crate::state::AppState;

#[derive(Debug, Clone, Parser)]
#[command(name = "kiro-gateway", version, about = "OpenAI/Anthropic-compatible gateway over pooled Kiro credentials")]
pub struct CliArgs {
    /// Database DSN (required to bootstrap the rest of config).
    #[arg(long, env = "KIRO_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "KIRO_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "KIRO_PORT")]
    pub port: Option<String>,

    /// Admin key (plaintext). Stored as a hash in the DB and memory.
    #[arg(long, env = "KIRO_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "KIRO_PROXY")]
    pub proxy: Option<String>,

    /// Redact sensitive headers/body fields in emitted events.
    #[arg(long, env = "KIRO_EVENT_REDACT_SENSITIVE")]
    pub event_redact_sensitive: Option<String>,
}

pub struct Bootstrap {
    pub store: Store,
    pub state: Arc<AppState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let dsn = sanitize_dsn_value(args.dsn.clone());
    let host = sanitize_optional_env_value(args.host.clone());
    let port = parse_u16_env_value(args.port.clone(), "KIRO_PORT")?;
    let admin_key = sanitize_optional_env_value(args.admin_key.clone());
    let proxy = sanitize_optional_env_value(args.proxy.clone());
    let event_redact_sensitive = parse_bool_env_value(args.event_redact_sensitive.clone(), "KIRO_EVENT_REDACT_SENSITIVE")?;

    ensure_sqlite_parent_dir(&dsn)?;

    let store = Store::connect(&dsn).await.context("connect storage")?;
    store.sync().await.context("schema sync")?;

    // CLI/ENV fields override, DB fills the rest — clap already resolves
    // CLI-over-ENV per field; we overlay that result on top of the DB row.
    let db_global = store.get_global_config_row().await.context("load db global_config")?;
    let mut merged = db_global.map(|row| GlobalConfigPatch::from(row.config)).unwrap_or_default();

    let mut admin_key_hash_override: Option<String> = None;
    if let Some(key_plain) = admin_key.as_deref() {
        admin_key_hash_override = Some(hash_admin_key(key_plain));
    } else if merged.admin_key_hash.is_none() {
        let key_plain = generate_admin_key();
        eprintln!("generated admin key: {key_plain}");
        admin_key_hash_override = Some(hash_admin_key(&key_plain));
    }

    let cli_patch = GlobalConfigPatch {
        host,
        port,
        admin_key_hash: admin_key_hash_override,
        proxy,
        dsn: Some(dsn),
        event_redact_sensitive,
        ..Default::default()
    };
    merged.overlay(cli_patch);

    let global: GlobalConfig = merged.into_config().context("finalize merged global config")?;
    store.upsert_global_config(&global).await.context("upsert global_config")?;

    let events = EventHub::new(1024);
    events.add_sink(Arc::new(TerminalEventSink::new())).await;

    let credential_pool = Arc::new(CredentialPool::new(events.clone()));
    let refresh_client = wreq::Client::new();
    let credential_manager = Arc::new(CredentialManager::new(store.clone(), credential_pool.clone(), refresh_client));
    let upstream_client = Arc::new(
        KiroUpstreamClient::new(UpstreamClientConfig {
            max_retries: global.request_max_retries,
            base_delay: std::time::Duration::from_millis(global.request_base_delay_ms),
            ..Default::default()
        })
        .context("build upstream client")?,
    );

    let state = AppState::from_bootstrap(
        global,
        store.clone(),
        events,
        credential_pool,
        credential_manager,
        upstream_client,
    )
    .await
    .context("build app state")?;

    Ok(Bootstrap { store, state: Arc::new(state) })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn sanitize_dsn_value(value: Option<String>) -> String {
    sanitize_optional_env_value(value).unwrap_or_else(default_dsn)
}

fn default_dsn() -> String {
    if let Some(data_dir) = sanitize_optional_env_value(std::env::var("KIRO_DATA_DIR").ok()) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/kiro-gateway.db?mode=rwc");
    }
    "sqlite://kiro-gateway.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    if path_part.is_empty() {
        return None;
    }
    let mut normalized = path_part;
    if let Some(stripped) = normalized.strip_prefix("//") {
        normalized = stripped;
    }
    if normalized.to_ascii_lowercase() == ":memory:" {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw.parse::<u16>().with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}

fn hash_admin_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn generate_admin_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::sqlite_file_path_from_dsn;

    #[test]
    fn sqlite_dsn_resolves_relative_path() {
        let path = sqlite_file_path_from_dsn("sqlite://kiro-gateway.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "kiro-gateway.db");
    }

    #[test]
    fn sqlite_dsn_resolves_absolute_path() {
        let path = sqlite_file_path_from_dsn("sqlite://app/data/kiro-gateway.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "/app/data/kiro-gateway.db");
    }

    #[test]
    fn sqlite_memory_dsn_is_ignored() {
        assert!(sqlite_file_path_from_dsn("sqlite::memory:").is_none());
        assert!(sqlite_file_path_from_dsn("sqlite://:memory:").is_none());
    }
}
