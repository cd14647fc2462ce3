//! Retry policy engine.
//!
//! Every remote operation runs through [`PolicyEngine::execute`]:
//!
//! ```text
//!   ┌────────► select endpoint ──► channel ──► attempt
//!   │                                             │
//!   │                                   report outcome to pool
//!   │                                             │
//!   │            ┌──────────── classify ◄─────────┘
//!   │            │
//!   │   Fatal ───┼──► return error unmodified
//!   │   Redirect ┼──► (within redirect cap) re-select immediately ───┐
//!   │   Retryable┴──► backoff (clamped to deadline) ─────────────────┤
//!   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Retries are bounded by `max_retries` and by the call deadline; a backoff that
//! would sleep past the deadline ends the call instead. Cancellation aborts both
//! attempts and backoff sleeps.

use super::backoff::Backoff;
use crate::cluster::{Endpoint, EndpointPool, Preference};
use crate::core::error::{ClientError, ClientResult, GrpcCode, Outcome};
use crate::core::time::{bounded, Deadline};
use crate::net::transport::ChannelHandle;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the engine should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Back off and try again.
    Retryable,
    /// Re-select an endpoint immediately.
    Redirect,
    /// Give up and surface the error.
    Fatal,
}

/// Error classifier for one kind of operation.
pub type Classifier = fn(&ClientError) -> ErrorClass;

/// Idempotent operations: anything transient is retried.
pub fn classify_idempotent(err: &ClientError) -> ErrorClass {
    match err {
        ClientError::NotLeader { .. } => ErrorClass::Redirect,
        e if e.is_retriable() => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

/// Mutations: retried only when the request provably never reached a server.
pub fn classify_mutation(err: &ClientError) -> ErrorClass {
    match err {
        ClientError::NotLeader { .. } => ErrorClass::Redirect,
        e if e.is_undelivered() => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

/// Long-lived streams: every disconnect is retried; server rejections are not.
pub fn classify_stream(err: &ClientError) -> ErrorClass {
    match err {
        ClientError::NotLeader { .. } => ErrorClass::Redirect,
        ClientError::Rpc { code, .. } => match code {
            GrpcCode::Cancelled | GrpcCode::Unknown | GrpcCode::Internal => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        },
        ClientError::InvalidRequest { .. }
        | ClientError::DecompressionFailed { .. }
        | ClientError::Compacted { .. }
        | ClientError::LeaseExpired { .. }
        | ClientError::LeaseRevoked { .. }
        | ClientError::LeaseNotFound { .. }
        | ClientError::Config { .. }
        | ClientError::Tls { .. }
        | ClientError::Closed
        | ClientError::Cancelled
        | ClientError::DeadlineExceeded { .. }
        | ClientError::Exhausted { .. } => ErrorClass::Fatal,
        ClientError::Transient { .. }
        | ClientError::Unreachable { .. }
        | ClientError::NoHealthyEndpoint
        | ClientError::CircuitOpen { .. } => ErrorClass::Retryable,
    }
}

/// Retry limits and backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `None` retries until the deadline.
    pub max_retries: Option<u32>,
    /// Delay curve between retries.
    pub backoff: Backoff,
    /// Redirects followed without backoff or retry credit.
    pub redirect_cap: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(4),
            backoff: Backoff::default(),
            redirect_cap: 1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries (redirects are still followed).
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Self::default()
        }
    }

    /// Same curve with no attempt limit.
    pub fn unbounded(&self) -> Self {
        Self {
            max_retries: None,
            ..self.clone()
        }
    }
}

/// Per-invocation bookkeeping. Never outlives the call.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub operation: &'static str,
    /// Attempts started, including redirects.
    pub attempt: u32,
    /// Retries charged against `max_retries`.
    pub retries: u32,
    pub redirects: u32,
    pub deadline: Deadline,
    pub accumulated_delay: Duration,
    pub last_endpoint: Option<String>,
}

impl AttemptContext {
    fn new(operation: &'static str, deadline: Deadline) -> Self {
        Self {
            operation,
            attempt: 0,
            retries: 0,
            redirects: 0,
            deadline,
            accumulated_delay: Duration::ZERO,
            last_endpoint: None,
        }
    }

    fn exhausted(&self, err: ClientError) -> ClientError {
        tracing::warn!(
            operation = self.operation,
            attempts = self.attempt,
            endpoint = ?self.last_endpoint,
            error = %err,
            "retries exhausted"
        );
        ClientError::Exhausted {
            attempts: self.attempt,
            last_endpoint: self.last_endpoint.clone(),
            source: Box::new(err),
        }
    }
}

/// What one attempt receives.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Endpoint selected for this attempt.
    pub endpoint: Arc<Endpoint>,
    /// Its channel.
    pub channel: ChannelHandle,
    /// 1-based attempt number.
    pub number: u32,
    /// The call's overall deadline.
    pub deadline: Deadline,
}

impl Attempt {
    /// Per-attempt timeout: whatever is left of the call deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.deadline.remaining()
    }
}

/// Description of one call for the engine.
#[derive(Debug, Clone)]
pub struct CallSpec<'a> {
    pub operation: &'static str,
    pub preference: Preference,
    pub policy: &'a RetryPolicy,
    pub classify: Classifier,
    pub deadline: Deadline,
    pub cancel: CancellationToken,
}

/// Runs attempts against the pool under a retry policy.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    pool: Arc<EndpointPool>,
}

impl PolicyEngine {
    /// Create an engine over `pool`.
    pub fn new(pool: Arc<EndpointPool>) -> Self {
        Self { pool }
    }

    /// The endpoint pool.
    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    /// Execute `op` with endpoint selection, outcome reporting and retries.
    pub async fn execute<T, F, Fut>(&self, spec: CallSpec<'_>, mut op: F) -> ClientResult<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let CallSpec {
            operation,
            preference,
            policy,
            classify,
            deadline,
            cancel,
        } = spec;
        let mut ctx = AttemptContext::new(operation, deadline);

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            if deadline.is_expired() {
                return Err(deadline.exceeded());
            }
            ctx.attempt += 1;

            let (endpoint, err) = match self.pool.select(preference) {
                Err(err) => (None, err),
                Ok(endpoint) => {
                    ctx.last_endpoint = Some(endpoint.address().to_string());
                    let number = ctx.attempt;
                    let result = bounded(&deadline, &cancel, async {
                        let channel = self.pool.channel(&endpoint).await?;
                        op(Attempt {
                            endpoint: Arc::clone(&endpoint),
                            channel,
                            number,
                            deadline,
                        })
                        .await
                    })
                    .await;
                    match result {
                        Ok(value) => {
                            self.pool.report(&endpoint, Outcome::Success);
                            return Ok(value);
                        }
                        Err(err) => (Some(endpoint), err),
                    }
                }
            };

            if let (Some(endpoint), Some(outcome)) = (&endpoint, err.outcome()) {
                self.pool.report(endpoint, outcome);
            }
            if matches!(
                err,
                ClientError::Cancelled | ClientError::DeadlineExceeded { .. }
            ) {
                return Err(err);
            }

            let class = classify(&err);
            tracing::debug!(
                operation,
                attempt = ctx.attempt,
                endpoint = ?ctx.last_endpoint,
                error = %err,
                ?class,
                "attempt failed"
            );
            match class {
                ErrorClass::Fatal => return Err(err),
                ErrorClass::Redirect if ctx.redirects < policy.redirect_cap => {
                    ctx.redirects += 1;
                    continue;
                }
                ErrorClass::Redirect | ErrorClass::Retryable => {}
            }

            if policy.max_retries.is_some() && matches!(err, ClientError::NoHealthyEndpoint) {
                return Err(err);
            }
            if policy.max_retries.is_some_and(|max| ctx.retries >= max) {
                return Err(ctx.exhausted(err));
            }
            ctx.retries += 1;
            let delay = policy.backoff.delay(ctx.retries);
            if deadline.remaining().is_some_and(|left| delay >= left) {
                return Err(ctx.exhausted(err));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            ctx.accumulated_delay += delay;
        }
    }
}
