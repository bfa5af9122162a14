//! Local port forwarding
//!
//! The accept loop hands every local connection to a [`RemoteDialer`] and
//! pipes the two streams together until either side is done.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use xk_core::error::ConnectionError;

/// Pause after a failed `accept` so a persistent error does not spin
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Byte stream to the remote end of a forwarded connection
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

pub type BoxedStream = Box<dyn RelayStream>;

/// Opens the remote side of a forwarded connection
#[async_trait]
pub trait RemoteDialer: Send + Sync + 'static {
    /// Open a stream to the forward target on behalf of `peer`
    async fn dial(&self, peer: SocketAddr) -> Result<BoxedStream, ConnectionError>;
}

/// Accept local connections until `cancel` fires
///
/// The listener is dropped when the loop returns, so the port stops
/// accepting as soon as the tunnel is cancelled. Connections already being
/// relayed are left to finish on their own.
pub async fn accept_loop<D: RemoteDialer>(
    listener: TcpListener,
    dialer: Arc<D>,
    cancel: CancellationToken,
    label: String,
) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    tracing::info!("[{}] Forwarding {} to node panel", label, local);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("[{}] Accept loop cancelled", label);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let dialer = Arc::clone(&dialer);
                    let label = label.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, dialer, label).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("[{}] Failed to accept local connection: {}", label, e);
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }
    }

    tracing::info!("[{}] Listener on {} closed", label, local);
}

async fn handle_connection<D: RemoteDialer>(
    stream: TcpStream,
    peer: SocketAddr,
    dialer: Arc<D>,
    label: String,
) {
    let remote = match dialer.dial(peer).await {
        Ok(remote) => remote,
        Err(e) => {
            // Dropping `stream` closes the local connection
            tracing::warn!("[{}] Failed to open forward channel for {}: {}", label, peer, e);
            return;
        }
    };

    match relay(stream, remote).await {
        Ok((up, down)) => {
            tracing::debug!(
                "[{}] Connection from {} closed ({} bytes up, {} bytes down)",
                label,
                peer,
                up,
                down
            );
        }
        Err(e) if is_disconnect(&e) => {
            tracing::debug!("[{}] Connection from {} dropped: {}", label, peer, e);
        }
        Err(e) => {
            tracing::warn!("[{}] Relay for {} failed: {}", label, peer, e);
        }
    }
}

/// Copy bytes both ways until either side finishes
///
/// Returns the byte counts (local to remote, remote to local).
pub async fn relay(mut local: TcpStream, mut remote: BoxedStream) -> io::Result<(u64, u64)> {
    tokio::io::copy_bidirectional(&mut local, &mut remote).await
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
