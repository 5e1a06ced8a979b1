//! # Chime Transport
//!
//! Connection endpoints for the Chime JSON-RPC framework: newline-delimited
//! JSON document framing over a byte stream, with lifecycle events.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod endpoint;
pub mod framing;

pub use endpoint::{Endpoint, EndpointEvent, EndpointHandle};

use thiserror::Error;

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket-level failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Structurally invalid document (valid JSON, wrong shape).
    #[error("Malformed document: {0}")]
    Malformed(String),

    /// Connection closed.
    #[error("Connection closed")]
    Closed,
}
