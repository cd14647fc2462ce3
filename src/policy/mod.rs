//! Retry, backoff and circuit-breaking policy.
//!
//! - [`backoff`] - Exponential backoff with jitter
//! - [`circuit`] - Per-endpoint circuit breaker
//! - [`retry`] - Error classification and the policy engine

pub mod backoff;
pub mod circuit;
pub mod retry;

pub use backoff::Backoff;
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use retry::{
    classify_idempotent, classify_mutation, classify_stream, Attempt, AttemptContext, CallSpec,
    Classifier, ErrorClass, PolicyEngine, RetryPolicy,
};
