//! Cluster membership as seen by the client.
//!
//! - [`endpoint`] - One member: address, health, circuit breaker, channel slot
//! - [`pool`] - Endpoint selection, outcome reporting, channel establishment
//! - [`target`] - Target string parsing

pub mod endpoint;
pub mod pool;
pub mod target;

pub use endpoint::{Endpoint, HealthRecord, HealthState};
pub use pool::{EndpointPool, EndpointSpec, PoolConfig, Preference};
pub use target::Target;
