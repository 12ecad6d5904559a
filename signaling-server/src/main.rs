use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = signaling_server::ServerConfig::parse();

    let filter = EnvFilter::from_default_env().add_directive("signaling_server=info".parse()?);
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let addr: SocketAddr = config.listen_addr().parse()?;
    tracing::info!(%addr, "starting rendezvous signaling server");

    let state = signaling_server::AppState::new(config).await?;
    let reaper = signaling_server::reaper::spawn(state.clone());

    let app = signaling_server::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    reaper.abort();
    state.log_error_counts();
    tracing::info!("signaling server stopped");
    Ok(())
}
