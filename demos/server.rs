//! Example server: reads settings from the environment, restores lifecycle state,
//! starts the health monitor and serves the project and data routes.

use schema_synth::{app, AppState, Engine, Settings};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("schema_synth=info".parse()?))
        .init();

    let settings = Settings::from_env()?;
    let addr = settings.bind_addr();
    let engine = Arc::new(Engine::connect(settings).await?);

    let shutdown = CancellationToken::new();
    let monitor = engine.spawn_health_monitor(shutdown.clone());

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    let signal = shutdown.clone();
    axum::serve(listener, app(AppState::new(engine)))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    monitor.await?;
    Ok(())
}
