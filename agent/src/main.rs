//! Node exec agent binary
//!
//! Connects to the local container engine, keeps the pod index fresh and
//! serves the HTTP API until SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_exec_agent::infra::{ContainerIndex, DockerRuntime, Runtime};
use node_exec_agent::{api, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::load()?);

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let http_addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;
    info!("Starting node exec agent");
    info!("HTTP listening on {}", http_addr);

    // Initialize infrastructure
    let docker = Arc::new(DockerRuntime::new(
        &config.docker_socket,
        config.docker_client_pool_size,
    )?);
    if let Err(e) = docker.ping().await {
        warn!("Docker engine not reachable yet: {}", e);
    }
    let runtime: Arc<dyn Runtime> = docker;

    let index = Arc::new(ContainerIndex::new());
    if let Err(e) = index.refresh(runtime.as_ref()).await {
        warn!("Initial container listing failed: {}", e);
    }
    info!("Container index loaded with {} pods", index.len());

    let shutdown = CancellationToken::new();
    let refresh = index.clone().spawn_refresh(
        runtime.clone(),
        config.refresh_interval(),
        shutdown.clone(),
    );

    let state = AppState::new(config.clone(), runtime, index);
    info!("Access token gate enabled={}", state.auth.is_enabled());
    let app = api::http::create_router(state);

    let result = axum::serve(
        tokio::net::TcpListener::bind(http_addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(e) = result {
        error!("HTTP server error: {}", e);
    }

    shutdown.cancel();
    let _ = refresh.await;
    info!("Agent shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
