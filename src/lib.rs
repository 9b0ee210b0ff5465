//! Codepod - disposable Dart coding sandboxes.
//!
//! Sessions live in a TTL-governed store. A lifecycle manager keeps one
//! language server container per live session, a worker pool runs
//! submitted programs in throwaway containers, and a WebSocket bridge
//! connects editors to their session's language server.

pub mod bridge;
pub mod config;
pub mod container;
pub mod error;
pub mod http_server;
pub mod jobs;
pub mod lifecycle;
pub mod session;
pub mod state;
pub mod store;

pub use error::{Error, Result};
