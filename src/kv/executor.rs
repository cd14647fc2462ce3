//! Unary call executor.
//!
//! Binds one request/response operation to the policy engine:
//!
//! ```text
//!   get/put/delete/txn ──► CallKind ──► (preference, classifier)
//!                                              │
//!                          PolicyEngine::execute (select, retry, report)
//!                                              │
//!                          ChannelHandle::call (compress, send, decode)
//! ```
//!
//! [`UnaryExecutor::iterate`] runs one such call per page of a large range.

use super::iterate::{self, RangePages};
use super::options::{DeleteOptions, GetOptions, PutOptions, TxnOptions};
use super::proto::{
    self, DeleteRangeResponse, MemberListRequest, MemberListResponse, PutResponse, RangeResponse,
    TxnResponse,
};
use super::txn::Txn;
use crate::cluster::{EndpointPool, Preference};
use crate::core::error::{ClientError, ClientResult};
use crate::core::time::CallOptions;
use crate::net::compression::CodecRegistry;
use crate::policy::{
    classify_idempotent, classify_mutation, CallSpec, Classifier, PolicyEngine, RetryPolicy,
};
use prost::Message;
use std::sync::Arc;
use std::time::Duration;

/// How a unary call is routed and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Linearizable read: leader preferred, transient failures retried.
    Read,
    /// Serializable read: any healthy member, transient failures retried.
    LocalRead,
    /// Write: leader preferred, retried only when never delivered.
    Write,
    /// Write that is safe to repeat (lease revoke).
    IdempotentWrite,
}

impl CallKind {
    pub fn preference(self) -> Preference {
        match self {
            CallKind::LocalRead => Preference::AnyHealthy,
            CallKind::Read | CallKind::Write | CallKind::IdempotentWrite => {
                Preference::PreferLeader
            }
        }
    }

    pub fn classifier(self) -> Classifier {
        match self {
            CallKind::Write => classify_mutation,
            CallKind::Read | CallKind::LocalRead | CallKind::IdempotentWrite => {
                classify_idempotent
            }
        }
    }
}

/// Runs unary RPCs through the policy engine.
#[derive(Debug, Clone)]
pub struct UnaryExecutor {
    engine: PolicyEngine,
    codecs: Arc<CodecRegistry>,
    policy: RetryPolicy,
    default_timeout: Duration,
}

impl UnaryExecutor {
    pub fn new(
        pool: Arc<EndpointPool>,
        codecs: Arc<CodecRegistry>,
        policy: RetryPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            engine: PolicyEngine::new(pool),
            codecs,
            policy,
            default_timeout,
        }
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Issue one unary RPC with retries.
    pub async fn unary<Req, Resp>(
        &self,
        operation: &'static str,
        path: &'static str,
        request: &Req,
        kind: CallKind,
        call: &CallOptions,
    ) -> ClientResult<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let spec = CallSpec {
            operation,
            preference: kind.preference(),
            policy: &self.policy,
            classify: kind.classifier(),
            deadline: call.deadline(self.default_timeout),
            cancel: call.token(),
        };
        let codecs = self.codecs.as_ref();
        self.engine
            .execute(spec, |attempt| async move {
                attempt
                    .channel
                    .call(path, request, codecs, attempt.timeout())
                    .await
            })
            .await
    }

    /// Range read.
    pub async fn get(&self, key: &[u8], options: &GetOptions) -> ClientResult<RangeResponse> {
        require_key(key)?;
        let kind = if options.is_serializable() {
            CallKind::LocalRead
        } else {
            CallKind::Read
        };
        let request = options.to_request(key);
        self.unary("get", proto::KV_RANGE, &request, kind, options.call())
            .await
    }

    /// Range read delivered page by page.
    pub fn iterate(&self, key: &[u8], options: &GetOptions) -> ClientResult<RangePages> {
        require_key(key)?;
        let kind = if options.is_serializable() {
            CallKind::LocalRead
        } else {
            CallKind::Read
        };
        iterate::pages(
            self.clone(),
            options.to_request(key),
            kind,
            options.call().clone(),
            options.page_size(),
            None,
        )
    }

    /// Put a single key.
    pub async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        options: &PutOptions,
    ) -> ClientResult<PutResponse> {
        require_key(key)?;
        let request = options.to_request(key, value);
        self.unary("put", proto::KV_PUT, &request, CallKind::Write, options.call())
            .await
    }

    /// Delete a key or range.
    pub async fn delete(
        &self,
        key: &[u8],
        options: &DeleteOptions,
    ) -> ClientResult<DeleteRangeResponse> {
        require_key(key)?;
        let request = options.to_request(key);
        self.unary(
            "delete",
            proto::KV_DELETE_RANGE,
            &request,
            CallKind::Write,
            options.call(),
        )
        .await
    }

    /// Commit a transaction.
    pub async fn txn(&self, txn: &Txn, options: &TxnOptions) -> ClientResult<TxnResponse> {
        let kind = if txn.is_read_only() {
            CallKind::Read
        } else {
            CallKind::Write
        };
        let request = txn.to_request();
        self.unary("txn", proto::KV_TXN, &request, kind, options.call())
            .await
    }

    /// Cluster membership as reported by any healthy member.
    pub async fn member_list(&self, call: &CallOptions) -> ClientResult<MemberListResponse> {
        let request = MemberListRequest { linearizable: false };
        self.unary(
            "member_list",
            proto::CLUSTER_MEMBER_LIST,
            &request,
            CallKind::LocalRead,
            call,
        )
        .await
    }
}

pub(crate) fn require_key(key: &[u8]) -> ClientResult<()> {
    if key.is_empty() {
        return Err(ClientError::invalid_request("key must not be empty"));
    }
    Ok(())
}
