use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;

use pproxy_accesslog::{LoggerRegistry, default_output_config};
use pproxy_auth::AuthService;
use pproxy_storage::{SqlStorage, Storage, seed_from_dir};

use crate::engine::ProxyEngine;
use crate::state::{AppState, ModelSnapshot};
use crate::upstream_client::{UpstreamClient, WreqUpstreamClient};

#[derive(Debug, Clone, Parser)]
#[command(name = "pproxy", version, about = "Prompt-injecting reverse proxy for model APIs")]
pub struct CliArgs {
    /// Directory holding seed descriptors, the db/ store, and logs/.
    #[arg(long, env = "PPROXY_CONFIG", default_value = "./configs")]
    pub config: PathBuf,

    /// Listen port for the proxy front-end.
    #[arg(long = "proxy-port", env = "PPROXY_PROXY_PORT", default_value_t = 8080)]
    pub proxy_port: u16,

    /// Listen port for the admin front-end.
    #[arg(long = "admin-port", env = "PPROXY_ADMIN_PORT", default_value_t = 8081)]
    pub admin_port: u16,
}

pub struct Bootstrap {
    pub state: Arc<AppState>,
    pub engine: Arc<ProxyEngine>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    bootstrap(CliArgs::parse()).await
}

/// Startup order: open the store, sync the schema, run the one-time seed
/// migration, build the credential service, install the default access
/// logger, load the model snapshot. Failures here are fatal; everything after
/// bind degrades per-request.
pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let db_dir = args.config.join("db");
    std::fs::create_dir_all(&db_dir)
        .with_context(|| format!("create db dir {}", db_dir.display()))?;
    let dsn = format!("sqlite://{}?mode=rwc", db_dir.join("config.db").display());

    let storage = Arc::new(
        SqlStorage::connect(&dsn)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    let seeded = seed_from_dir(storage.as_ref(), &args.config)
        .await
        .context("seed model records")?;
    if seeded > 0 {
        tracing::info!(seeded, "migrated model records from seed descriptors");
    }

    let auth = Arc::new(
        AuthService::bootstrap(storage.clone())
            .await
            .context("init credential service")?,
    );

    let logs = Arc::new(LoggerRegistry::new());
    logs.add_logger(default_output_config(&args.config.join("logs")))
        .context("init default access logger")?;

    let snapshot = storage.load_snapshot().await.context("load model snapshot")?;
    tracing::info!(models = snapshot.models.len(), "loaded model snapshot");

    let state = Arc::new(AppState {
        models: ArcSwap::from_pointee(ModelSnapshot::from_rows(snapshot.models)),
        storage,
        auth,
        logs,
        config_dir: args.config.clone(),
        proxy_port: args.proxy_port,
        admin_port: args.admin_port,
    });

    let client: Arc<dyn UpstreamClient> =
        Arc::new(WreqUpstreamClient::new().context("build upstream client")?);
    let engine = Arc::new(ProxyEngine::new(state.clone(), client));

    Ok(Bootstrap { state, engine })
}
