// Off-chain matching, risk, and settlement engine for perpetual futures
// Runs 24/7; the WebSocket frontage is the only network surface

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use perp_engine::config::EngineConfig;
use perp_engine::engine::Engine;
use perp_engine::store::{MemoryStore, RedisStore, SharedStore};
use perp_engine::ws::server::{health_check, websocket_handler};
use perp_engine::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    std::fs::create_dir_all("logs").ok();
    let file_appender = tracing_appender::rolling::daily("logs", "perp-engine.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_writer(non_blocking_file).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Keep the appender guard alive for the process lifetime.
    std::mem::forget(guard);

    let config = EngineConfig::from_env();
    if config.tokens.is_empty() {
        warn!("PERP_TOKENS is empty; no matching engines will start");
    }

    let store: SharedStore = match RedisStore::connect(&config.store_url).await {
        Ok(redis) => Arc::new(redis),
        Err(e) => {
            warn!(
                "redis unavailable ({}); falling back to in-memory store",
                e
            );
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Engine::start(config.clone(), store).await?;
    let app_state = AppState {
        engine: engine.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("perp engine listening on http://{}", config.listen_addr);

    let shutdown_engine = engine.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("signal listener failed: {}", e);
            }
            shutdown_engine.shutdown();
        })
        .await?;

    info!("perp engine stopped");
    Ok(())
}
