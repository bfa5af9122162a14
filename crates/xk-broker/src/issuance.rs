//! Key issuance
//!
//! Turns "user U wants access on node N" into a VLESS link: make sure the
//! node is reachable, find its primary inbound (retrying while the health
//! monitor repairs the tunnel), add the user's client if it is missing, and
//! render the link from the inbound as the panel now reports it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use xk_core::config::IssuanceConfig;
use xk_core::error::{ConnectionError, StoreError, XkError};
use xk_core::types::{Node, NodeId, UserId};
use xk_panel::defaults::{default_client, default_inbound, InboundTemplate};
use xk_panel::{Inbound, PanelClient, PanelError, VlessLink};

use crate::registry::NodeRegistry;

/// Errors from the issuance workflow
#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    /// The tunnel or the panel behind it is not working
    #[error("Node {node} is unreachable: {source}")]
    NodeUnreachable {
        node: NodeId,
        #[source]
        source: XkError,
    },

    /// The node has no inbound to add users to
    #[error("Node {0} has no primary inbound; provision it first")]
    NoPrimaryInbound(NodeId),

    #[error("Inbound {inbound_id} on node {node} unavailable after {attempts} attempt(s): {source}")]
    InboundUnavailable {
        node: NodeId,
        inbound_id: i64,
        attempts: u32,
        #[source]
        source: XkError,
    },

    /// The panel refused to add the user's client
    #[error("Panel rejected client {email}: {source}")]
    MemberRejected {
        email: String,
        #[source]
        source: PanelError,
    },

    /// The client was added but the inbound does not list it
    #[error("Client {email} missing from inbound {inbound_id} after creation")]
    MemberNotFound { email: String, inbound_id: i64 },

    #[error("Node {0} has no REALITY cover domain configured")]
    MissingRealityCover(NodeId),

    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for IssuanceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NodeNotFound(id) => IssuanceError::NodeNotFound(id),
            other => IssuanceError::Store(other),
        }
    }
}

/// Runs the issuance workflow against nodes of a registry
pub struct KeyIssuer {
    registry: NodeRegistry,
    config: IssuanceConfig,
    /// Serializes check-then-create per (node, user)
    user_locks: DashMap<(NodeId, UserId), Arc<Mutex<()>>>,
}

impl KeyIssuer {
    pub fn new(registry: NodeRegistry, config: IssuanceConfig) -> Self {
        Self {
            registry,
            config,
            user_locks: DashMap::new(),
        }
    }

    /// Issue (or re-issue) the access link for `user` on `node`
    ///
    /// Idempotent: a user who already has a client on the node gets the
    /// existing credential back.
    pub async fn issue_key(&self, node: &Node, user: UserId) -> Result<String, IssuanceError> {
        let key = (node.id, user);
        let lock = self.user_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.issue_key_locked(node, user).await
        };
        // Drop the entry unless another caller is holding or waiting on it
        self.user_locks.remove_if(&key, |_, entry| {
            Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2
        });
        result
    }

    async fn issue_key_locked(&self, node: &Node, user: UserId) -> Result<String, IssuanceError> {
        let email = user.email();
        tracing::info!("Issuing key for {} on node {}", email, node);

        let client = self
            .validate(node)
            .await
            .map_err(|source| IssuanceError::NodeUnreachable {
                node: node.id,
                source,
            })?;

        let inbound_id = node
            .inbound_id
            .ok_or(IssuanceError::NoPrimaryInbound(node.id))?;

        let (inbound, client) = self.resolve_inbound(node, client, inbound_id).await?;

        let client = if inbound.has_client(&email)? {
            tracing::debug!("Client {} already present in inbound {}", email, inbound_id);
            client
        } else {
            client
                .add_client(inbound_id, &default_client(&email, user.0))
                .await
                .map_err(|source| IssuanceError::MemberRejected {
                    email: email.clone(),
                    source,
                })?;
            tracing::info!(
                "Added client {} to inbound {} on node {}",
                email,
                inbound_id,
                node.id
            );
            client
        };

        let (inbound, _) = self.resolve_inbound(node, client, inbound_id).await?;

        let link = VlessLink::from_inbound(&inbound, &email, &node.ip).map_err(|e| match e {
            PanelError::ClientNotFound { inbound_id, email } => {
                IssuanceError::MemberNotFound { email, inbound_id }
            }
            other => IssuanceError::Panel(other),
        })?;

        Ok(link.render())
    }

    /// Create the default VLESS + REALITY inbound on `node`
    ///
    /// Returns the ID the panel assigned. Recording it is up to the caller.
    pub async fn create_routing_rule(&self, node: &Node) -> Result<i64, IssuanceError> {
        if node.reality_cover.trim().is_empty() {
            return Err(IssuanceError::MissingRealityCover(node.id));
        }

        let client = self
            .registry
            .ensure(node)
            .await
            .map_err(|source| IssuanceError::NodeUnreachable {
                node: node.id,
                source,
            })?;

        let cert = client.new_x25519_cert().await?;
        let template = InboundTemplate {
            remark: &self.config.inbound_remark,
            cover: node.reality_cover.trim(),
            listen: &node.ip,
            port: self.config.inbound_port,
        };
        let payload = default_inbound(&template, &cert)?;
        let inbound = client.add_inbound(&payload).await?;

        tracing::info!(
            "Created inbound {} ({}:{}) on node {}",
            inbound.id,
            inbound.listen,
            inbound.port,
            node
        );
        Ok(inbound.id)
    }

    fn user_lock(&self, key: (NodeId, UserId)) -> Arc<Mutex<()>> {
        let lock = self
            .user_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(&lock)
    }

    /// Check that the node's tunnel is up and its panel answers
    async fn validate(&self, node: &Node) -> Result<Arc<PanelClient>, XkError> {
        let client = self.registry.ensure(node).await?;

        let conn = self
            .registry
            .get(node.id)
            .await
            .ok_or(ConnectionError::NodeNotConnected(node.id))?;
        if !conn.tunnel.is_alive().await {
            return Err(ConnectionError::ConnectionLost(format!(
                "tunnel to node {} is not responding",
                node.id
            ))
            .into());
        }

        client.list_inbounds().await?;
        Ok(client)
    }

    /// Fetch the inbound, retrying while connectivity recovers
    ///
    /// Later attempts re-validate first. A node that is still broken gets a
    /// growing pause so the health monitor can put a new tunnel in place.
    async fn resolve_inbound(
        &self,
        node: &Node,
        mut client: Arc<PanelClient>,
        inbound_id: i64,
    ) -> Result<(Inbound, Arc<PanelClient>), IssuanceError> {
        let attempts = self.config.attempts.max(1);
        let mut last_err: Option<XkError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                match self.validate(node).await {
                    Ok(fresh) => client = fresh,
                    Err(e) => {
                        let pause = retry_pause(&self.config, attempt);
                        tracing::warn!(
                            "Node {} still unreachable on attempt {}/{}: {}; waiting {:?}",
                            node.id,
                            attempt + 1,
                            attempts,
                            e,
                            pause
                        );
                        last_err = Some(e);
                        tokio::time::sleep(pause).await;
                        continue;
                    }
                }
            }

            match client.get_inbound(inbound_id).await {
                Ok(inbound) => return Ok((inbound, client)),
                Err(e) => {
                    tracing::warn!(
                        "Fetching inbound {} on node {} failed (attempt {}/{}): {}",
                        inbound_id,
                        node.id,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_err = Some(e.into());
                }
            }
        }

        Err(IssuanceError::InboundUnavailable {
            node: node.id,
            inbound_id,
            attempts,
            source: last_err.unwrap_or_else(|| {
                ConnectionError::Timeout(format!("no attempt made for node {}", node.id)).into()
            }),
        })
    }
}

fn retry_pause(config: &IssuanceConfig, attempt: u32) -> Duration {
    config.retry_step * attempt
}
