//! Almanac MCP server core
//!
//! The machine-accessible control plane for the Almanac knowledge-base
//! assistant: an MCP (JSON-RPC 2.0) server exposing search, analytics, and
//! health capabilities over stdio and streamable HTTP, with OAuth
//! resource-server authorization on the network transport.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod providers;
pub mod registry;
pub mod transport;

pub use error::{AlmanacError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
