//! Built-in tools.
//!
//! Declarations (name, schema, confirmation default, category) live in the
//! registry; execution is split by category. Read-only filesystem and search
//! tools run in-process; shell/python/mutating-IO run inside the thread's
//! sandbox via command builders consumed by the core's tool invoker.

pub mod fs_tools;
pub mod registry;
pub mod sandbox_cmd;
pub mod validate;
pub mod web;

pub use fs_tools::WorkspaceFs;
pub use registry::BuiltinRegistry;
pub use web::WebSearchClient;
