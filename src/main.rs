use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use wolfconf::config::{AppConfig, LogFormat, ServerConfig};
use wolfconf::{socket, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    init_tracing(&config.server);

    let state = AppState::new(config.rooms.clone());
    let app = socket::routes(state, &config.server);

    let addr = config.server.socket_addr()?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, ws_path = %config.server.ws_path, "signaling server listening");

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn init_tracing(server: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&server.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match server.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
