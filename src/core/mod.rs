//! Core infrastructure shared by every client component.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Error taxonomy and wire status mapping
//! - [`time`] - Deadlines, call options and cancellation
//! - [`telemetry`] - Tracing subscriber setup

pub mod config;
pub mod error;
pub mod telemetry;
pub mod time;
