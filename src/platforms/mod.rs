//! Concrete platform adapters.
//!
//! Each adapter is a thin wire mapper over [`crate::client::core::ClientRuntime`]:
//! one per delivery mechanism. `telegram` long-polls, `slack` reads a
//! realtime socket, `graph` holds a webhook subscription. Platform
//! transports sit behind small traits so tests can stub the network.

pub mod graph;
pub mod slack;
pub mod telegram;
