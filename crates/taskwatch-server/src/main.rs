use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskwatch_server::{health, App, Components, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("taskwatch starting (modules: {})", config.modules.join(","));
    let components = Components::open(&config).await?;
    let app = App::start(&config, components).await?;

    if let Some(port) = config.health_port {
        let cancel = app.cancel_token();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, cancel).await {
                error!("health server failed: {e}");
            }
        });
        info!("health endpoint: http://0.0.0.0:{port}/health");
    }

    shutdown_signal().await;
    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("received shutdown signal");
}
