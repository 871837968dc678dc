pub mod handlers;
pub mod routes;
pub mod state;
pub mod static_files;
pub mod templates;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::WebConfig;
use state::AppState;

pub async fn run_server(config: WebConfig, state: Arc<AppState>) -> Result<(), Box<dyn Error + Send + Sync>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let sweep = spawn_session_sweeper(state.clone(), config.session_ttl_secs);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    sweep.abort();
    Ok(())
}

fn spawn_session_sweeper(state: Arc<AppState>, ttl_secs: u64) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(ttl_secs.clamp(1, 60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let evicted = state.evict_idle(chrono::Utc::now()).await;
            if evicted > 0 {
                info!("Evicted {} idle sessions", evicted);
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
