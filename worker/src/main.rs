mod agent;
mod executor;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::shuffle::ShuffleStore;

use crate::agent::AgentConfig;
use crate::executor::{ExecutorContext, FetchConfig, HttpBlockSource};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,axum=info")),
        )
        .init();

    let config = AgentConfig::from_env();
    let shuffle_bind =
        std::env::var("SHUFFLE_BIND").unwrap_or_else(|_| "0.0.0.0:8090".to_string());
    let advertise_url = std::env::var("SHUFFLE_ADVERTISE_URL").unwrap_or_else(|_| {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        let port = shuffle_bind.rsplit(':').next().unwrap_or("8090");
        format!("http://{host}:{port}")
    });
    let scratch_dir = PathBuf::from(
        std::env::var("WORKER_SCRATCH_DIR").unwrap_or_else(|_| "/data/scratch".to_string()),
    );

    let shuffle = ShuffleStore::new(scratch_dir.join("shuffle"))?;
    let ctx = Arc::new(ExecutorContext {
        shuffle: shuffle.clone(),
        advertise_url,
        scratch_dir: scratch_dir.join("tasks"),
        fetch: FetchConfig::from_env(),
        source: Arc::new(HttpBlockSource::new()),
    });

    // shuffle server for other workers' reduce tasks
    let app = server::build_router(shuffle);
    let listener = TcpListener::bind(&shuffle_bind).await?;
    info!(
        "shuffle server listening on {} (advertised as {})",
        listener.local_addr()?,
        ctx.advertise_url
    );
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("shuffle server stopped: {}", e);
        }
    });

    agent::run(config, ctx).await
}
