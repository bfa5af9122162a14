//! Outbound SSH tunnel connector
//!
//! Connects to a node over SSH, binds a local listener and forwards it to
//! the node's loopback panel port.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::Disconnect;
use russh_keys::key::KeyPair;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use xk_core::config::{BrokerConfig, HostKeyPolicy, PortAllocation};
use xk_core::error::ConnectionError;
use xk_core::traits::{Tunnel, TunnelOpener};
use xk_core::types::{Node, NodeId};

use crate::forward::{self, BoxedStream, RemoteDialer};
use crate::handler::ClientHandler;
use crate::port;

/// Host the panel listens on, as seen from the node
const PANEL_HOST: &str = "127.0.0.1";

/// Keepalive interval for node SSH sessions
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Opens SSH tunnels with one shared key pair
pub struct SshTunnelOpener {
    key: Arc<KeyPair>,
    ssh_config: Arc<Config>,
    known_hosts_path: PathBuf,
    host_key_policy: HostKeyPolicy,
    connect_timeout: Duration,
    port_allocation: PortAllocation,
}

impl SshTunnelOpener {
    /// Load the private key and build an opener from the broker config
    pub fn new(config: &BrokerConfig) -> Result<Self, ConnectionError> {
        let key_path = &config.ssh_key_path;
        if !key_path.exists() {
            return Err(ConnectionError::KeyNotFound {
                path: key_path.clone(),
                reason: "file does not exist".to_string(),
            });
        }

        let key = russh_keys::load_secret_key(key_path, None).map_err(|e| {
            ConnectionError::KeyNotFound {
                path: key_path.clone(),
                reason: format!("failed to load key: {}", e),
            }
        })?;
        tracing::info!("Loaded SSH key from {}", key_path.display());

        let ssh_config = Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        };

        Ok(Self {
            key: Arc::new(key),
            ssh_config: Arc::new(ssh_config),
            known_hosts_path: config.known_hosts_path.clone(),
            host_key_policy: config.host_key_policy,
            connect_timeout: config.connect_timeout,
            port_allocation: config.port_allocation,
        })
    }

    /// Dial and authenticate
    async fn connect(&self, node: &Node) -> Result<Handle<ClientHandler>, ConnectionError> {
        let addr = node.ssh_addr();
        let handler = ClientHandler::new(
            node.ip.clone(),
            node.ssh_port,
            self.known_hosts_path.clone(),
            self.host_key_policy,
        );

        tracing::debug!("Connecting to {} ({})", addr, node.name);
        let mut session = tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::clone(&self.ssh_config), addr.as_str(), handler),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(addr.clone()))?
        .map_err(|e| match e.downcast::<ConnectionError>() {
            Ok(rejected) => rejected,
            Err(e) => ConnectionError::ConnectFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            },
        })?;

        tracing::debug!("Authenticating as user '{}'", node.ssh_user);
        let authenticated = tokio::time::timeout(
            self.connect_timeout,
            session.authenticate_publickey(&node.ssh_user, Arc::clone(&self.key)),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(addr.clone()))?
        .map_err(|e| ConnectionError::ConnectFailed {
            addr: addr.clone(),
            reason: format!("authentication error: {}", e),
        })?;

        if !authenticated {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(ConnectionError::AuthenticationFailed {
                user: node.ssh_user.clone(),
                host: addr,
            });
        }

        Ok(session)
    }
}

#[async_trait]
impl TunnelOpener for SshTunnelOpener {
    async fn open(&self, node: &Node) -> Result<Box<dyn Tunnel>, ConnectionError> {
        tracing::info!(
            "Opening tunnel to node {} ({}:{}, panel port {})",
            node.id,
            node.ip,
            node.ssh_port,
            node.api_port
        );

        let handle = Arc::new(self.connect(node).await?);

        let (listener, local_port) = match port::bind_listener(self.port_allocation).await {
            Ok(bound) => bound,
            Err(e) => {
                let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let dialer = Arc::new(ChannelDialer {
            handle: Arc::clone(&handle),
            api_port: node.api_port,
        });
        let accept_task = tokio::spawn(forward::accept_loop(
            listener,
            dialer,
            cancel.clone(),
            format!("node {}", node.id),
        ));

        tracing::info!(
            "Tunnel to node {} up: 127.0.0.1:{} -> {}:{}",
            node.id,
            local_port,
            PANEL_HOST,
            node.api_port
        );

        Ok(Box::new(SshTunnel {
            node_id: node.id,
            handle,
            local_port,
            check_timeout: self.connect_timeout,
            cancel,
            accept_task: Mutex::new(Some(accept_task)),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Opens `direct-tcpip` channels to the panel port
struct ChannelDialer {
    handle: Arc<Handle<ClientHandler>>,
    api_port: u16,
}

#[async_trait]
impl RemoteDialer for ChannelDialer {
    async fn dial(&self, peer: SocketAddr) -> Result<BoxedStream, ConnectionError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                PANEL_HOST,
                u32::from(self.api_port),
                peer.ip().to_string(),
                u32::from(peer.port()),
            )
            .await
            .map_err(|e| ConnectionError::ChannelFailed(e.to_string()))?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// A live SSH tunnel to one node
pub struct SshTunnel {
    node_id: NodeId,
    handle: Arc<Handle<ClientHandler>>,
    local_port: u16,
    check_timeout: Duration,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Open and immediately close a session channel
    async fn is_alive(&self) -> bool {
        if self.cancel.is_cancelled() || self.handle.is_closed() {
            return false;
        }

        match tokio::time::timeout(self.check_timeout, self.handle.channel_open_session()).await {
            Ok(Ok(channel)) => {
                let _ = channel.close().await;
                true
            }
            Ok(Err(e)) => {
                tracing::debug!("Liveness channel for node {} failed: {}", self.node_id, e);
                false
            }
            Err(_) => {
                tracing::debug!("Liveness channel for node {} timed out", self.node_id);
                false
            }
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("Closing tunnel to node {}", self.node_id);

        // Listener first, then the SSH session
        self.cancel.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Accept loop for node {} ended abnormally: {}", self.node_id, e);
            }
        }

        if self.handle.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| ConnectionError::ConnectionLost(e.to_string()))
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
