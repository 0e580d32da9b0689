use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use prostream_hub::bridge::routes::routes;
use prostream_hub::config::Config;
use prostream_hub::handlers::serve_signaling;
use prostream_hub::registry::SessionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    let registry = Arc::new(SessionRegistry::new(config.session_idle()));
    registry.spawn_reaper(config.reap_interval());

    let bridges = config.bridges();
    bridges.spawn_reaper(config.reap_interval());
    for platform in bridges.platforms() {
        if let Some(manager) = bridges.get(platform) {
            info!(%platform, limits = ?manager.limits(), "bridge ready");
        }
    }

    let listener = TcpListener::bind(config.signal_addr)
        .await
        .with_context(|| format!("failed to bind signaling listener on {}", config.signal_addr))?;
    info!("Listening on: {}", config.signal_addr);
    tokio::spawn(serve_signaling(listener, registry.clone()));

    let (http_addr, server) = warp::serve(routes(bridges.clone()))
        .try_bind_with_graceful_shutdown(config.http_addr, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("could not listen for ctrl-c: {}", err);
                std::future::pending::<()>().await;
            }
        })
        .with_context(|| format!("failed to bind bridge listener on {}", config.http_addr))?;
    info!("Bridge HTTP listening on: {}", http_addr);

    server.await;

    info!("shutting down, stopping live streams");
    bridges.shutdown_all().await;
    Ok(())
}
