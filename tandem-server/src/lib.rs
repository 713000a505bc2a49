//! # tandem-server: WebSocket access to collaborative documents
//!
//! Wraps a [`tandem_collab::Curator`] in a JSON-over-WebSocket protocol.
//! See [`protocol`] for the message formats.

pub mod config;
pub mod protocol;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use protocol::{ClientRequest, NewDocument, ServerResponse};
pub use server::Server;
