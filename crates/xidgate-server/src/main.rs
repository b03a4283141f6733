use anyhow::Context;
use clap::Parser;
use tokio::signal;
use xidgate_server::server::{
    config::{CliArgs, ServerConfig},
    service::handler::{AuthorityService, Listeners},
    telemetry::init_telemetry,
};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let listeners = Listeners::bind(&config).await?;
    log_startup_info(&listeners, &config)?;

    let service = AuthorityService::start(config);
    let serving = tokio::spawn({
        let service = service.clone();
        async move { service.serve(listeners).await }
    });

    let signalled = shutdown_signal(&service).await;
    match &signalled {
        Ok(()) => tracing::info!("Shutdown signal received, terminating gracefully..."),
        Err(e) => tracing::error!("Signal handling failed, shutting down: {e:#}"),
    }

    service.shutdown().await;
    if let Err(e) = serving.await {
        tracing::error!("Accept loop panicked: {e}");
    }

    tracing::info!("Service shut down successfully");
    providers.shutdown();
    signalled
}

fn log_startup_info(listeners: &Listeners, config: &ServerConfig) -> anyhow::Result<()> {
    let control = listeners.control_addr()?;
    let broadcast = listeners.broadcast_addr()?;
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting authority: control on {control}, broadcast on {broadcast}, full config: {config:#?}"
        );
    } else {
        tracing::info!(
            node = config.node_id,
            first_xid = %config.first_xid,
            pool_target = config.pool_target,
            "Starting authority: control on {control}, broadcast on {broadcast}"
        );
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. SIGUSR1 writes the diagnostics dump to the
/// log and keeps waiting.
///
/// # Errors
///
/// Fails if a signal handler cannot be installed.
async fn shutdown_signal(service: &AuthorityService) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    #[cfg(unix)]
    let mut user1 = signal::unix::signal(signal::unix::SignalKind::user_defined1())
        .context("failed to install SIGUSR1 handler")?;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        #[cfg(unix)]
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C signal");
                return Ok(());
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM signal");
                return Ok(());
            }
            _ = user1.recv() => log_dump(service).await,
        }

        #[cfg(not(unix))]
        {
            let _ = service;
            (&mut ctrl_c)
                .await
                .context("failed to listen for Ctrl+C")?;
            tracing::info!("Received Ctrl+C signal");
            return Ok(());
        }
    }
}

#[cfg(unix)]
async fn log_dump(service: &AuthorityService) {
    match service.dump().await {
        Ok(dump) => tracing::info!("Diagnostics dump:\n{dump}"),
        Err(e) => tracing::warn!("Diagnostics dump failed: {e}"),
    }
}
