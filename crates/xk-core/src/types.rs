//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use xk_panel::Credentials;

/// Identifier of a managed node, as assigned by the node store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for NodeId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Identifier of an end user (their Telegram user ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// Synthetic email under which the user's client is registered on a panel
    pub fn email(&self) -> String {
        format!("tg_{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A remote proxy node running a 3x-ui panel on loopback
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Public address, used for SSH and as the advertised link address
    pub ip: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Panel port on the node's loopback interface
    pub api_port: u16,
    pub api_username: String,
    pub api_password: String,
    /// Domain REALITY impersonates for inbounds created on this node
    #[serde(default)]
    pub reality_cover: String,
    /// Primary inbound, once provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_id: Option<i64>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

impl Node {
    /// `ip:ssh_port`, bracketing IPv6 addresses
    pub fn ssh_addr(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.ssh_port)
        } else {
            format!("{}:{}", self.ip, self.ssh_port)
        }
    }

    /// Panel login credentials
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.api_username, &self.api_password)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field("api_port", &self.api_port)
            .field("api_username", &self.api_username)
            .field("api_password", &"<redacted>")
            .field("reality_cover", &self.reality_cover)
            .field("inbound_id", &self.inbound_id)
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.id, self.ip)
    }
}

/// Connection status of a node in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Tunnel and panel client are registered
    Connected,
    /// Not registered and nothing is trying to connect
    Disconnected,
    /// A background reconnect loop is running for the node
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ip: &str) -> Node {
        Node {
            id: NodeId(1),
            name: "ams-1".to_string(),
            ip: ip.to_string(),
            ssh_port: 2222,
            ssh_user: "root".to_string(),
            api_port: 2053,
            api_username: "admin".to_string(),
            api_password: "hunter2".to_string(),
            reality_cover: "example.com".to_string(),
            inbound_id: None,
        }
    }

    #[test]
    fn test_user_email() {
        assert_eq!(UserId(42).email(), "tg_42");
    }

    #[test]
    fn test_ssh_addr() {
        assert_eq!(node("203.0.113.7").ssh_addr(), "203.0.113.7:2222");
        assert_eq!(node("2001:db8::1").ssh_addr(), "[2001:db8::1]:2222");
    }

    #[test]
    fn test_debug_hides_password() {
        let debug = format!("{:?}", node("203.0.113.7"));
        assert!(debug.contains("ams-1"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_node_defaults_from_toml() {
        let toml = r#"
            id = 3
            name = "fra-1"
            ip = "198.51.100.4"
            api_port = 2053
            api_username = "admin"
            api_password = "pw"
        "#;
        let node: Node = toml::from_str(toml).unwrap();
        assert_eq!(node.id, NodeId(3));
        assert_eq!(node.ssh_port, 22);
        assert_eq!(node.ssh_user, "root");
        assert_eq!(node.inbound_id, None);
    }

    #[test]
    fn test_connection_status_display() {
        assert_eq!(format!("{}", ConnectionStatus::Connected), "connected");
        assert_eq!(
            format!("{}", ConnectionStatus::Reconnecting),
            "reconnecting"
        );
    }
}
