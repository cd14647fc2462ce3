//! Watch subscriptions that survive disconnects.
//!
//! - [`state`] - Subscription state, options and events
//! - [`manager`] - Per-subscription stream tasks and the consumer handle

pub mod manager;
pub mod state;

pub use manager::{WatchConfig, WatchManager, WatchStream};
pub use state::{EventKind, WatchEvent, WatchFilters, WatchOptions, WatchState, WatchStatus};
