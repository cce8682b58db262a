use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, error, info};

use super::AppContext;
use super::handler;

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", addr))?;
    let local_addr = listener.local_addr().unwrap_or(addr);
    info!(address = %local_addr, port = local_addr.port(), "proxy listener started");
    Ok(listener)
}

/// Accepts connections until `shutdown` flips to `true` or its sender is dropped.
///
/// At most `max_connections` connections are in flight; the permit is taken before `accept`,
/// so a limit of 1 handles clients strictly one after another.
pub async fn serve(
    listener: TcpListener,
    app: AppContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(app.settings.max_connections));

    loop {
        if *shutdown.borrow() {
            break;
        }
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => permit.context("connection limiter closed")?,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept incoming connection");
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on client stream");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer_addr, connection_app, permit).await {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }

    info!("proxy listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: AppContext,
    _permit: OwnedSemaphorePermit,
) -> Result<()> {
    handler::handle_connection(stream, peer, app).await
}
