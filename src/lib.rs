//! Lattice client - resilient access to replicated etcd-compatible key-value clusters.
//!
//! The client speaks the etcd v3 gRPC protocol to a cluster in which one member
//! leads at a time. It keeps a pool of endpoints with observed health, routes each
//! call through a retry and circuit-breaking policy engine, negotiates payload
//! compression per channel, and keeps watches and lease heartbeats alive across
//! leader changes and network failures.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Client                               │
//! │   get/put/delete/txn   │   watch   │   grant/keep-alive/revoke  │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                      │                    │
//! ┌────────────────┐   ┌──────────────────┐   ┌────────────────────┐
//! │ UnaryExecutor  │   │  WatchManager    │   │   LeaseManager     │
//! └────────────────┘   └──────────────────┘   └────────────────────┘
//!          └──────────────────────┼────────────────────┘
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        PolicyEngine (classify, backoff, redirect, deadline)     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   EndpointPool (health, leader flag, circuit breaker, channel)  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Connector → RpcChannel │ CodecRegistry │ SecurityManager (TLS) │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error taxonomy and status mapping
//! - [`core::time`] - Deadlines and call options
//! - [`core::telemetry`] - Tracing subscriber setup
//!
//! ## Networking
//! - [`net::compression`] - Codec registry and negotiation
//! - [`net::tls`] - TLS and mTLS client configuration
//! - [`net::security`] - Security profiles and credential rotation
//! - [`net::transport`] - Connector and channel traits
//! - [`net::grpc`] - gRPC over HTTP/2 transport
//!
//! ## Cluster and policy
//! - [`cluster::endpoint`] - Endpoint health state machine
//! - [`cluster::pool`] - Endpoint selection and channel ownership
//! - [`cluster::target`] - Target string parsing
//! - [`policy::backoff`] - Exponential backoff with jitter
//! - [`policy::circuit`] - Per-endpoint circuit breaker
//! - [`policy::retry`] - Error classification and the policy engine
//!
//! ## Operations
//! - [`kv`] - Key-value options, transactions, tables, paginated reads and the unary executor
//! - [`watch`] - Watch subscriptions
//! - [`lease`] - Leases and keep-alive heartbeats
//!
//! # Key Invariants
//!
//! - **One channel per endpoint**: channels are replaced, never mutated
//! - **Bounded calls**: no call outlives its deadline; retries never exceed the limit
//! - **Ordered watches**: events arrive in revision order with no duplicates across reconnects
//! - **Single keep-alive**: at most one keep-alive in flight per lease

// Core infrastructure
pub mod core;

// Networking
pub mod net;

// Endpoint pool
pub mod cluster;

// Retry and circuit breaking
pub mod policy;

// Key-value operations
pub mod kv;

// Watch streams
pub mod watch;

// Leases
pub mod lease;

// Caller-facing client
pub mod client;

// Re-exports for convenience
pub use self::core::config::{ClientConfig, ConfigOverrides};
pub use self::core::error::{ClientError, ClientResult, GrpcCode, Outcome, RpcStatus};
pub use self::core::time::CallOptions;
pub use client::{Client, ClientBuilder};
pub use cluster::{EndpointPool, HealthState, Preference};
pub use kv::{
    prefix_end, Compare, CompareOp, DeleteOptions, GetOptions, KeyValue, Op, PutOptions,
    RangePages, Table, TableInfo, Tables, Txn, TxnOptions,
};
pub use lease::{LeaseGrant, LeaseKeeper, LeaseRenewal, LeaseStatus};
pub use net::compression::CodecRegistry;
pub use net::tls::SecurityProfile;
pub use policy::{ErrorClass, RetryPolicy};
pub use watch::{EventKind, WatchEvent, WatchFilters, WatchOptions, WatchStatus, WatchStream};
