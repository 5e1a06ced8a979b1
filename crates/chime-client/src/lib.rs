//! # Chime Client
//!
//! JSON-RPC 2.0 client for the Chime framework: per-call request
//! correlation, timeout-bounded synchronous waits, and server-pushed signal
//! notifications.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;

pub use client::{CallHandle, Client};

use thiserror::Error;

use chime_core::codec::CodecError;
use chime_transport::TransportError;

/// Errors surfaced for one call.
#[derive(Error, Debug)]
pub enum CallError {
    /// The server answered with a JSON-RPC error object.
    #[error("remote error ({code}): {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i32,
        /// Error message.
        message: String,
        /// Additional data, if the server attached any.
        data: Option<serde_json::Value>,
    },

    /// No response arrived within the configured call timeout.
    #[error("call timed out")]
    Timeout,

    /// The response carried a known id but neither `result` nor `error`.
    #[error("malformed response: neither result nor error present")]
    MalformedResponse,

    /// Parameters or results could not be converted.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The connection failed or was closed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No connection is up.
    #[error("not connected")]
    NotConnected,
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}
