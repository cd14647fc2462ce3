//! Error types and status mapping.
//!
//! Every failure the client can observe is expressed as a [`ClientError`]. Wire-level
//! failures arrive as an [`RpcStatus`] (gRPC status code, message and an optional
//! leader hint) and are folded into the taxonomy here, so the policy engine and the
//! endpoint pool never look at raw status codes.
//!
//! ```text
//!   RpcStatus ──► ClientError ──► Outcome (endpoint health)
//!                      │
//!                      └──────► ErrorClass (retry policy, per operation)
//! ```

use std::time::Duration;
use thiserror::Error;

/// Client error conditions.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Network hiccup or timeout after the request may have reached a server.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// The endpoint could not be reached; the request was never delivered.
    #[error("endpoint {endpoint} unreachable: {message}")]
    Unreachable { endpoint: String, message: String },

    /// The responding member is not the leader.
    #[error("not leader (hint: {})", leader_hint.as_deref().unwrap_or("none"))]
    NotLeader { leader_hint: Option<String> },

    /// Every endpoint in the pool is dead or short-circuited.
    #[error("no healthy endpoint available")]
    NoHealthyEndpoint,

    /// The circuit breaker for the endpoint is open.
    #[error("circuit open for endpoint {endpoint}")]
    CircuitOpen { endpoint: String },

    /// The server rejected the request with a non-retryable status.
    #[error("rpc failed with {code:?}: {message}")]
    Rpc { code: GrpcCode, message: String },

    /// The request is malformed before it ever leaves the client.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// A response payload could not be decompressed or decoded.
    #[error("corrupt payload ({codec}): {message}")]
    DecompressionFailed { codec: String, message: String },

    /// The server compacted history past the watch resume point.
    #[error(
        "watch history compacted at revision {compact_revision}; resume point was {resume_revision}"
    )]
    Compacted {
        compact_revision: i64,
        resume_revision: i64,
    },

    /// The lease expired, either on the server or locally after missed keep-alives.
    #[error("lease {lease_id} expired")]
    LeaseExpired { lease_id: i64 },

    /// The lease was revoked.
    #[error("lease {lease_id} revoked")]
    LeaseRevoked { lease_id: i64 },

    /// The lease is unknown to the server.
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: i64 },

    /// The caller's deadline passed.
    #[error("deadline exceeded after {elapsed:?}")]
    DeadlineExceeded { elapsed: Duration },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Retries ran out; carries the last failure.
    #[error(
        "retries exhausted after {attempts} attempt(s), last endpoint {}: {source}",
        last_endpoint.as_deref().unwrap_or("<none>")
    )]
    Exhausted {
        attempts: u32,
        last_endpoint: Option<String>,
        #[source]
        source: Box<ClientError>,
    },

    /// Invalid client configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// TLS material could not be loaded or used.
    #[error("tls error: {message}")]
    Tls { message: String },

    /// The client has been closed.
    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Create a Transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create an Unreachable error.
    pub fn unreachable(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a Config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a Tls error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a DecompressionFailed error.
    pub fn corrupt(codec: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DecompressionFailed {
            codec: codec.into(),
            message: message.into(),
        }
    }

    /// Check if the failure guarantees the request never reached a server.
    ///
    /// Only these failures are safe to retry for non-idempotent writes.
    pub fn is_undelivered(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::CircuitOpen { .. } | Self::NoHealthyEndpoint
        )
    }

    /// Check if a retry may succeed where this attempt failed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. }) || self.is_undelivered()
    }

    /// Check if the server answered with NotFound.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Rpc {
                code: GrpcCode::NotFound,
                ..
            } | Self::LeaseNotFound { .. }
        )
    }

    /// Check if this error describes a lease lifecycle transition rather than a transport failure.
    pub fn is_lease_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::LeaseExpired { .. } | Self::LeaseRevoked { .. } | Self::LeaseNotFound { .. }
        )
    }

    /// Strip an `Exhausted` wrapper, returning the last underlying failure.
    pub fn root(&self) -> &ClientError {
        match self {
            Self::Exhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Map this error onto the endpoint health vocabulary.
    ///
    /// Returns `None` for failures that say nothing about the endpoint (local
    /// cancellation, exhausted pools, configuration problems).
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Transient { .. } => Some(Outcome::TransientFailure),
            Self::Unreachable { .. } => Some(Outcome::Unreachable),
            Self::NotLeader { leader_hint } => Some(Outcome::NotLeader {
                leader_hint: leader_hint.clone(),
            }),
            // The server answered, so the endpoint itself is alive.
            Self::Rpc { .. }
            | Self::InvalidRequest { .. }
            | Self::Compacted { .. }
            | Self::LeaseExpired { .. }
            | Self::LeaseRevoked { .. }
            | Self::LeaseNotFound { .. } => Some(Outcome::Success),
            Self::NoHealthyEndpoint
            | Self::CircuitOpen { .. }
            | Self::DecompressionFailed { .. }
            | Self::DeadlineExceeded { .. }
            | Self::Cancelled
            | Self::Exhausted { .. }
            | Self::Config { .. }
            | Self::Tls { .. }
            | Self::Closed => None,
        }
    }
}

/// Result type using ClientError.
pub type ClientResult<T> = Result<T, ClientError>;

/// Outcome of one attempt against one endpoint, as seen by the endpoint pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The endpoint answered.
    Success,
    /// The call failed but the endpoint may be fine.
    TransientFailure,
    /// The endpoint is not the leader; optionally names the one that is.
    NotLeader { leader_hint: Option<String> },
    /// The endpoint could not be reached.
    Unreachable,
}

// ============================================================================
// Wire status mapping
// ============================================================================

/// gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrpcCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl GrpcCode {
    /// Parse the numeric value carried in a `grpc-status` trailer.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }
}

/// Messages etcd-compatible servers use when a follower rejects a leader-only request.
const NOT_LEADER_MARKERS: [&str; 3] = ["not leader", "leader changed", "no leader"];

/// A non-OK status returned by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcStatus {
    /// Status code.
    pub code: GrpcCode,
    /// Status message.
    pub message: String,
    /// Address of the current leader, when the server supplied one.
    pub leader_hint: Option<String>,
}

impl RpcStatus {
    /// Create a status without a leader hint.
    pub fn new(code: GrpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            leader_hint: None,
        }
    }

    /// Attach a leader hint.
    pub fn with_leader_hint(mut self, hint: impl Into<String>) -> Self {
        self.leader_hint = Some(hint.into());
        self
    }

    fn mentions_leadership(&self) -> bool {
        let lowered = self.message.to_ascii_lowercase();
        NOT_LEADER_MARKERS.iter().any(|m| lowered.contains(m))
    }
}

impl From<RpcStatus> for ClientError {
    fn from(status: RpcStatus) -> Self {
        if status.leader_hint.is_some() || status.mentions_leadership() {
            return ClientError::NotLeader {
                leader_hint: status.leader_hint,
            };
        }
        match status.code {
            GrpcCode::Unavailable
            | GrpcCode::DeadlineExceeded
            | GrpcCode::ResourceExhausted
            | GrpcCode::Aborted => ClientError::Transient {
                message: format!("{:?}: {}", status.code, status.message),
            },
            code => ClientError::Rpc {
                code,
                message: status.message,
            },
        }
    }
}
