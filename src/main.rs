use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;

use photo_locator::api;
use photo_locator::clock::system_clock;
use photo_locator::config::Config;
use photo_locator::metrics;
use photo_locator::state_manager::{AppState, Collaborators};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with filters
    // Connection-level chatter from the HTTP stack is rarely useful
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info")
                    .add_directive("hyper=warn".parse().expect("static directive"))
                    .add_directive("reqwest=warn".parse().expect("static directive"))
            }),
        )
        .init();

    tracing::info!("Starting photo locator...");

    metrics::init_metrics();

    let config = Config::load()?;
    tracing::info!(
        mode = ?config.locate_mode,
        geo_strategy = ?config.geo_config.strategy,
        model = %config.openai_config.model,
        debug_routes = config.debug_token.is_some(),
        "Configuration loaded"
    );

    let http = reqwest::Client::builder()
        .user_agent(config.geo_config.user_agent.clone())
        .connect_timeout(Duration::from_secs(5))
        .build()?;

    let collaborators = Collaborators::from_config(&config, &http);
    let state = AppState::new(&config, collaborators, http, system_clock());
    tracing::info!("AppState initialized");

    // Periodic TTL sweep of caches and jobs
    let sweeper = state.clone();
    let sweep_every = Duration::from_secs(config.sweep_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            sweeper.sweep();
        }
    });

    let app = api::router(state);

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.api_host, config.api_port)).await?;
    tracing::info!("HTTP API listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}
