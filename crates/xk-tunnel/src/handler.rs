//! russh client handler

use std::path::PathBuf;

use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;
use xk_core::config::HostKeyPolicy;

use crate::known_hosts;

/// SSH client handler for one node connection
///
/// Only host key verification is customised; the tunnel never receives
/// data on channels it did not open.
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub(crate) fn new(
        host: impl Into<String>,
        port: u16,
        known_hosts_path: PathBuf,
        policy: HostKeyPolicy,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            known_hosts_path,
            policy,
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Verify the server's host key
    ///
    /// A rejection is returned as a `ConnectionError::HostKeyRejected`
    /// wrapped in the handler error, so the connector can tell it apart
    /// from transport failures.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        known_hosts::verify(
            &self.known_hosts_path,
            self.policy,
            &self.host,
            self.port,
            server_public_key,
        )?;
        Ok(true)
    }
}
