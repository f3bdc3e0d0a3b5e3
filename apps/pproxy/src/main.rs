use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let boot = pproxy_core::bootstrap::bootstrap_from_env().await?;
    let state = boot.state.clone();

    let proxy_app = pproxy_router::proxy_router(boot.engine.clone());
    let admin_app = pproxy_router::admin_router(state.clone());

    let proxy_bind = format!("0.0.0.0:{}", state.proxy_port);
    let admin_bind = format!("0.0.0.0:{}", state.admin_port);
    let proxy_listener = tokio::net::TcpListener::bind(&proxy_bind)
        .await
        .with_context(|| format!("bind proxy listener on {proxy_bind}"))?;
    let admin_listener = tokio::net::TcpListener::bind(&admin_bind)
        .await
        .with_context(|| format!("bind admin listener on {admin_bind}"))?;
    tracing::info!(bind = %proxy_bind, "proxy front-end listening");
    tracing::info!(bind = %admin_bind, "admin front-end listening");

    let proxy = tokio::spawn(async move {
        axum::serve(
            proxy_listener,
            proxy_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });
    let admin = tokio::spawn(async move {
        axum::serve(
            admin_listener,
            admin_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });

    tokio::select! {
        result = proxy => result.context("proxy server task")?.context("proxy server exited")?,
        result = admin => result.context("admin server task")?.context("admin server exited")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Flush and close the access loggers before exit.
    state.logs.close();
    Ok(())
}
