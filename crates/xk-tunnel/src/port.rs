//! Local listener allocation

use std::io::ErrorKind;
use std::net::Ipv4Addr;

use tokio::net::TcpListener;
use xk_core::config::PortAllocation;
use xk_core::error::ConnectionError;

/// Bind the loopback listener for a tunnel, returning it with its port
///
/// The returned listener is the one that gets used, so a port found free
/// cannot be taken by someone else before the tunnel starts accepting.
pub async fn bind_listener(
    allocation: PortAllocation,
) -> Result<(TcpListener, u16), ConnectionError> {
    let listener = match allocation {
        PortAllocation::Ephemeral => TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?,
        PortAllocation::Sequential { start } => bind_from(start).await?,
    };
    let port = listener.local_addr()?.port();
    tracing::debug!("Bound local port {}", port);
    Ok((listener, port))
}

async fn bind_from(start: u16) -> Result<TcpListener, ConnectionError> {
    for port in start..=u16::MAX {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                continue
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ConnectionError::NoFreePort { start })
}
