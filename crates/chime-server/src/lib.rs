//! # Chime Server
//!
//! JSON-RPC 2.0 server for the Chime framework: a namespaced service
//! registry with reflective dispatch and parameter coercion, plus a signal
//! bridge pushing server-side events to subscribed clients as notifications.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bridge;
mod dispatch;
mod server;

pub use server::Server;

use thiserror::Error;

/// Server errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A service domain contained a reserved character.
    #[error("invalid domain '{0}': must not contain '/'")]
    InvalidDomain(String),
}
