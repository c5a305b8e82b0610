use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zonefile_sync_core::{StoreClient, SyncSession, Termination};
use zonefile_sync_etcd::{connect, Config, EtcdTransport, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let settings = Settings::load(&config)?;

    info!("Starting zonefile-sync");
    info!("  Endpoints: {}", settings.endpoints.join(","));
    info!("  Key prefix: {}", settings.key_prefix);
    info!("  Zonefiles: {}", settings.zonefiles_path.display());
    info!("  Snapshot retries: {}", settings.retry.retries);

    let client = connect(&settings).await?;

    let store = StoreClient::new(Arc::new(EtcdTransport::new(client)))
        .with_retry(settings.retry)
        .with_request_timeout(settings.request_timeout);

    let session = SyncSession::new(
        store,
        settings.key_prefix.clone(),
        settings.zonefiles_path.clone(),
    );

    let summary = session.run(create_shutdown_signal()).await?;
    match summary.termination {
        Termination::StreamClosed => info!(
            "Watch closed by etcd after {} change(s) since revision {}",
            summary.events_applied, summary.revision
        ),
        Termination::Stopped => info!(
            "Stopped after {} change(s) since revision {}",
            summary.events_applied, summary.revision
        ),
    }
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, stopping"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, stopping");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
