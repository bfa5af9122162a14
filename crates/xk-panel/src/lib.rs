//! xk-panel: Client for the 3x-ui management panel
//!
//! Every managed node runs a 3x-ui panel that only listens on loopback.
//! This crate speaks its JSON API (reached through an SSH tunnel by the
//! rest of x-Keeper), models inbounds and their clients, builds default
//! payloads, and renders VLESS access links.

pub mod client;
pub mod defaults;
pub mod error;
pub mod link;
pub mod types;

pub use client::{ClientOptions, Credentials, PanelClient};
pub use error::PanelError;
pub use link::{RealityParams, VlessLink};
pub use types::{
    AddInboundPayload, ApiResponse, ClientStats, Inbound, InboundClient, InboundSettings,
    StreamSettings, X25519Cert,
};
