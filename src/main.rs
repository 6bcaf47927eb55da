//! scanforge - Main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use scanforge::config::Config;
use scanforge::runner::RunnerPool;
use scanforge::server::{self, AppState};
use scanforge::store::{self, JobTracker, MemoryJobStore};

#[derive(Parser, Debug)]
#[command(name = "scanforge")]
#[command(about = "QC job service: runs a containerized analysis tool over uploaded datasets")]
#[command(version)]
struct Args {
    /// Listen port (overrides HTTP_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Workspace root directory (overrides WORKSPACE_ROOT)
    #[arg(long)]
    workspace_root: Option<std::path::PathBuf>,

    /// Skip the shared store even if REDIS_URL is set (for testing)
    #[arg(long)]
    no_redis: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scanforge=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!("Starting scanforge...");

    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(root) = args.workspace_root {
        config.workspace.root = root;
    }

    tokio::fs::create_dir_all(&config.workspace.root).await?;
    tracing::info!(
        "Workspace root at {}, tool image {}",
        config.workspace.root.display(),
        config.tool.image
    );

    let store = if args.no_redis {
        tracing::warn!("Shared store disabled by --no-redis");
        Arc::new(MemoryJobStore::new()) as Arc<dyn store::JobStore>
    } else {
        store::connect(&config.store).await
    };
    let tracker = JobTracker::new(store);

    let (log_tx, _) = tokio::sync::broadcast::channel(1024);
    let runner = Arc::new(RunnerPool::new(
        config.tool.clone(),
        tracker.clone(),
        log_tx.clone(),
    ));
    tracing::info!(
        "Runner pool ready ({} concurrent job slots)",
        config.tool.max_concurrent_jobs
    );

    let host = config.http.host.clone();
    let port = config.http.port;
    let state = AppState {
        config: Arc::new(config),
        tracker,
        runner,
        log_tx,
    };

    server::serve(state, &host, port)
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    Ok(())
}
