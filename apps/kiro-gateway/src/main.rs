use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let boot = kiro_core::bootstrap_from_env().await?;
    let bind = {
        let global = boot.state.global.load();
        format!("{}:{}", global.host, global.port)
    };

    kiro_core::scheduler::spawn(boot.state.clone());

    let engine = Arc::new(kiro_core::ProxyEngine::new(boot.state.clone()));
    let app = kiro_router::build_router(engine, boot.store.clone());

    let listener = tokio::net::TcpListener::bind(&bind).await.context("bind listener")?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
