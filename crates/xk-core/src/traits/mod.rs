//! Core trait definitions

mod store;
mod tunnel;

pub use store::NodeStore;
pub use tunnel::{Tunnel, TunnelOpener};
