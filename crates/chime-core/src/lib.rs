//! # Chime Core
//!
//! Core types for the Chime peer-to-peer JSON-RPC 2.0 framework.
//!
//! This crate provides:
//! - The typed value codec, including the `{typename, value}` envelope for
//!   user-defined types
//! - Service descriptors and runtime operation registration
//! - JSON-RPC 2.0 wire types and error codes
//! - Configuration loading and validation (JSON5 format)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod rpc;
pub mod service;

pub use codec::{CodecError, NamedShape, TypeRegistry, TypeTag, Value};
pub use config::{ClientConfig, Config, ConfigError, ServerConfig};
pub use rpc::{ErrorObject, Request, Response};
pub use service::{
    InvokeError, OpDescriptor, OpKind, RegisteredService, Service, ServiceBuilder,
    ServiceDescriptor, SignalHub, SpyId,
};
