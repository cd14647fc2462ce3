//! Deadlines and per-call options.
//!
//! All timing uses `tokio::time::Instant` so that tests can drive the clock with a
//! paused runtime. A [`Deadline`] is fixed once per operation; retries, backoff
//! sleeps and per-attempt timeouts are all clamped to it.

use crate::core::error::{ClientError, ClientResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default overall call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// An absolute point in time an operation must finish by.
///
/// `Deadline::never()` is used by long-lived loops (watch reconnects) that retry
/// without a wall-clock bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    started: Instant,
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: Some(started + timeout),
        }
    }

    /// A deadline that never passes.
    pub fn never() -> Self {
        Self {
            started: Instant::now(),
            at: None,
        }
    }

    /// Time remaining, or `None` when unbounded.
    ///
    /// Returns `Some(Duration::ZERO)` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time since the operation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Clamp a duration so that it never runs past the deadline.
    pub fn clamp(&self, wanted: Duration) -> Duration {
        match self.remaining() {
            Some(left) => wanted.min(left),
            None => wanted,
        }
    }

    /// The error reported when this deadline passes.
    pub fn exceeded(&self) -> ClientError {
        ClientError::DeadlineExceeded {
            elapsed: self.elapsed(),
        }
    }
}

/// Per-call options shared by every operation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overall deadline for the operation, including retries.
    pub timeout: Option<Duration>,
    /// Cancellation signal; cancelling aborts the operation at the next suspension point.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Create empty call options (client defaults apply).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the overall timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Resolve into a deadline, falling back to `default_timeout`.
    pub fn deadline(&self, default_timeout: Duration) -> Deadline {
        Deadline::after(self.timeout.unwrap_or(default_timeout))
    }

    /// The cancellation token, or a fresh one that never fires.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone().unwrap_or_default()
    }
}

/// Run `fut` until it completes, the deadline passes or `cancel` fires.
pub async fn bounded<F, T>(deadline: &Deadline, cancel: &CancellationToken, fut: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    match deadline.remaining() {
        Some(left) => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                res = tokio::time::timeout(left, fut) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(deadline.exceeded()),
                },
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                res = fut => res,
            }
        }
    }
}
