use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use notify_hub::config::HubConfig;
use notify_hub::core::Hub;
use notify_hub::handlers::{routes, WsTransport};

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv_result {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Load config from .env
    let config = match HubConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("Configuration: host={}, port={}", config.host, config.port);

    let transport = Arc::new(WsTransport::new());
    let hub = Hub::new(&config, transport.clone());

    // Build the server address
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting notification hub on {}", addr);

    let shutdown_hub = hub.clone();
    let bound = warp::serve(routes(hub, transport)).try_bind_with_graceful_shutdown(addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    });

    match bound {
        Ok((_, server)) => server.await,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    }

    info!("Shutdown signal received, disconnecting clients");
    shutdown_hub.shutdown().await;
}
