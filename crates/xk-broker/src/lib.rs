//! xk-broker: Connection registry and key issuance for x-Keeper
//!
//! Keeps one SSH tunnel and one authenticated panel client per managed
//! node, repairs them when they die, and issues per-user VLESS access
//! links through them.

pub mod broker;
pub mod issuance;
pub mod registry;

pub use broker::Broker;
pub use issuance::{IssuanceError, KeyIssuer};
pub use registry::{NodeConnection, NodeRegistry, RegistrySettings};
