use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use maestro_gateway::app;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maestro_gateway=info,tower_http=warn".into()),
        )
        .init();

    // load config: explicit path via MAESTRO_CONFIG > ./maestro.toml
    let config = match maestro_core::config::MaestroConfig::load(None) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let state = match app::AppState::build(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(2);
        }
    };
    let router = app::build_router(state);

    let addr: SocketAddr = match format!("{bind}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid bind address: {e}");
            return ExitCode::from(2);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("maestro gateway listening on {addr}");

    let serve = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });
    if let Err(e) = serve.await {
        error!("server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
