//! xk-tunnel: SSH tunnels to managed nodes
//!
//! Each node's panel only listens on loopback. A tunnel opens an SSH
//! session to the node, binds a local listener, and relays every accepted
//! connection to the panel port over a `direct-tcpip` channel.

pub mod forward;
pub mod known_hosts;
pub mod port;

mod connector;
mod handler;
mod reconnect;

pub use connector::{SshTunnel, SshTunnelOpener};
pub use forward::{accept_loop, relay, BoxedStream, RemoteDialer};
pub use port::bind_listener;
pub use reconnect::ExponentialBackoff;
