//! Networking layer.
//!
//! This module handles transport, compression and security:
//! - [`compression`] - Codec registry and per-channel negotiation
//! - [`tls`] - TLS and mTLS client configuration
//! - [`security`] - Security profiles and credential rotation
//! - [`transport`] - Connector and channel traits
//! - [`grpc`] - gRPC over HTTP/2 connector

pub mod compression;
pub mod grpc;
pub mod security;
pub mod tls;
pub mod transport;
