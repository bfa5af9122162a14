//! Pool entries and connection construction

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use xk_core::config::{PanelConfig, PanelScheme};
use xk_core::error::XkError;
use xk_core::traits::{Tunnel, TunnelOpener};
use xk_core::types::{Node, NodeId};
use xk_panel::{PanelClient, PanelError};

/// A node's tunnel together with the panel client bound to it
#[derive(Clone)]
pub struct NodeConnection {
    pub node_id: NodeId,
    /// Distinguishes successive connections to the same node
    pub generation: u64,
    pub tunnel: Arc<dyn Tunnel>,
    pub client: Arc<PanelClient>,
    pub connected_at: Instant,
}

impl NodeConnection {
    /// Local port of the tunnel
    pub fn local_port(&self) -> u16 {
        self.tunnel.local_port()
    }
}

impl std::fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnection")
            .field("node_id", &self.node_id)
            .field("generation", &self.generation)
            .field("local_port", &self.local_port())
            .field("panel", &self.client.base_url().as_str())
            .finish()
    }
}

/// Everything guarded by the registry mutex
pub(crate) struct PoolState {
    pub(crate) connections: HashMap<NodeId, NodeConnection>,
    pub(crate) monitors: HashMap<NodeId, CancellationToken>,
    pub(crate) reconnecting: HashMap<NodeId, CancellationToken>,
    /// Parent of every monitor and reconnect token; replaced by `close_all`
    pub(crate) shutdown: CancellationToken,
}

impl PoolState {
    pub(crate) fn new() -> Self {
        Self {
            connections: HashMap::new(),
            monitors: HashMap::new(),
            reconnecting: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Open a tunnel to `node` and log in to its panel through it
///
/// The panel is validated by listing inbounds. If that fails the tunnel is
/// closed again before the error is returned.
pub(crate) async fn build_connection(
    opener: &dyn TunnelOpener,
    panel: &PanelConfig,
    node: &Node,
    generation: u64,
) -> Result<NodeConnection, XkError> {
    let tunnel: Arc<dyn Tunnel> = Arc::from(opener.open(node).await?);

    match connect_panel(panel, node, tunnel.local_port()).await {
        Ok(client) => Ok(NodeConnection {
            node_id: node.id,
            generation,
            tunnel,
            client: Arc::new(client),
            connected_at: Instant::now(),
        }),
        Err(e) => {
            if let Err(close_err) = tunnel.close().await {
                tracing::debug!(
                    "Failed to close tunnel to node {} after panel error: {}",
                    node.id,
                    close_err
                );
            }
            Err(e.into())
        }
    }
}

/// Build a panel client for `127.0.0.1:<port>` and check that it works
async fn connect_panel(
    panel: &PanelConfig,
    node: &Node,
    port: u16,
) -> Result<PanelClient, PanelError> {
    match panel.scheme {
        PanelScheme::Https => try_scheme("https", panel, node, port).await,
        PanelScheme::Http => try_scheme("http", panel, node, port).await,
        PanelScheme::Auto => match try_scheme("https", panel, node, port).await {
            Err(e) if e.is_transport() => {
                tracing::debug!(
                    "HTTPS to node {} panel failed ({}), falling back to HTTP",
                    node.id,
                    e
                );
                try_scheme("http", panel, node, port).await
            }
            other => other,
        },
    }
}

async fn try_scheme(
    scheme: &str,
    panel: &PanelConfig,
    node: &Node,
    port: u16,
) -> Result<PanelClient, PanelError> {
    let base_url = format!("{}://127.0.0.1:{}", scheme, port);
    let client = PanelClient::new(&base_url, node.credentials(), panel.client_options())?;
    let inbounds = client.list_inbounds().await?;
    tracing::info!(
        "Panel for node {} reachable at {} ({} inbound(s))",
        node.id,
        base_url,
        inbounds.len()
    );
    Ok(client)
}
