mod handlers;
mod scheduler;
mod state;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::SchedulerConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=debug,tower_http=info")),
        )
        .init();

    let config = SchedulerConfig::from_env();
    info!("scheduler config: {:?}", config);
    let state = state::shared(config);

    // background scheduling loop (liveness, admission, speculation)
    let scheduler_state = state.clone();
    tokio::spawn(async move {
        scheduler::run(scheduler_state).await;
    });

    let app = handlers::build_router(state);

    let bind = std::env::var("COORDINATOR_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&bind).await.unwrap();
    info!("coordinator listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
