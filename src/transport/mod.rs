//! Transports carrying JSON-RPC frames to and from the dispatcher
//!
//! stdio serializes one request at a time per connection and runs locally
//! with no authorization layer. HTTP permits concurrent requests per
//! session, each independently authenticated and authorized.

pub mod http;
pub mod stdio;

pub use http::HttpServer;
pub use stdio::StdioServer;
