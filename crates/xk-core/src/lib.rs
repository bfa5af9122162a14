//! xk-core: Core abstractions and configuration for x-Keeper
//!
//! This crate provides the node model, configuration structures, the error
//! taxonomy, and the traits the tunnel engine and broker are written
//! against.

pub mod config;
pub mod error;
pub mod store;
pub mod traits;
pub mod types;

pub use error::XkError;
pub use store::TomlNodeStore;
pub use types::{ConnectionStatus, Node, NodeId, UserId};
