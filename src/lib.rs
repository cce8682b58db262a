pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use crate::{
    proxy::{cache::DiskCache, error_pages::ErrorPages},
    settings::Settings,
};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let app = build_app(settings).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_shutdown_task(shutdown_tx);
    proxy::run(app, shutdown_rx).await
}

/// Prepares the cache root and error pages; nothing is bound yet.
pub async fn build_app(settings: Arc<Settings>) -> Result<proxy::AppContext> {
    let cache = Arc::new(
        DiskCache::new(
            settings.cache_dir.clone(),
            settings.expiry(),
            settings.cache_max_entry_size,
        )
        .await?,
    );
    let error_pages = Arc::new(ErrorPages::prepare(settings.error_pages_dir.clone()).await?);
    tracing::info!(
        cache_dir = %cache.root().display(),
        error_pages_dir = %error_pages.dir().display(),
        expiry_secs = settings.expiry_time,
        "cache ready"
    );
    Ok(proxy::AppContext::new(settings, cache, error_pages))
}

/// Flips `shutdown_tx` on Ctrl-C or SIGTERM. The sender is never dropped early, since the accept
/// loop treats a closed channel as a shutdown request.
fn spawn_shutdown_task(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = interrupt() => {}
                _ = term.recv() => tracing::info!("received SIGTERM; shutting down"),
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            interrupt().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    interrupt().await;
}

async fn interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received interrupt; shutting down"),
        Err(err) => {
            tracing::error!(error = %err, "failed to listen for interrupt");
            std::future::pending::<()>().await;
        }
    }
}
