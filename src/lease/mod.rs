//! Leases and their keep-alive heartbeats.
//!
//! - [`state`] - Lease records and lifecycle
//! - [`manager`] - Grant, revoke, keep-alive scheduling

pub mod manager;
pub mod state;

pub use manager::{LeaseConfig, LeaseGrant, LeaseKeeper, LeaseManager, LeaseRenewal, LeaseTimeToLive};
pub use state::{LeaseRecord, LeaseStatus};
