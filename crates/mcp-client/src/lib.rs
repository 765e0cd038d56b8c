//! External tool-server client (MCP).
//!
//! A tool server is a child process speaking newline-delimited JSON-RPC 2.0
//! over stdio. After the `initialize` handshake its tools are discovered via
//! `tools/list` and exposed to the engine namespaced as `{server}__{tool}`,
//! so two servers can both export a `search` without colliding.
//!
//! Transport failures are soft: a dead or slow server produces a failed tool
//! result for the model to react to, never a terminal turn error.

mod config;
mod manager;
mod protocol;
mod transport;

pub use config::ToolServerConfig;
pub use manager::{ServerError, ToolServerManager};
pub use protocol::{namespaced, split_namespaced, NAMESPACE_SEPARATOR};
pub use transport::TransportError;
