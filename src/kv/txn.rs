//! Transactions: `If(compares) Then(ops) Else(ops)`.
//!
//! ```text
//!   Txn::new()
//!       .when([Compare::version("k", CompareOp::Equal, 0)])
//!       .and_then([Op::put("k", "v", PutOptions::new())])
//!       .or_else([Op::get("k", GetOptions::new())])
//! ```
//!
//! A transaction whose branches contain only reads is idempotent and retried
//! like a read; anything that writes is retried like a put.

use super::executor::UnaryExecutor;
use super::options::{prefix_end, DeleteOptions, GetOptions, PutOptions, TxnOptions};
use super::proto::{self, compare, request_op, RequestOp, TxnRequest, TxnResponse};
use crate::core::error::ClientResult;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    Greater,
    Less,
    NotEqual,
}

impl From<CompareOp> for compare::CompareResult {
    fn from(op: CompareOp) -> Self {
        match op {
            CompareOp::Equal => compare::CompareResult::Equal,
            CompareOp::Greater => compare::CompareResult::Greater,
            CompareOp::Less => compare::CompareResult::Less,
            CompareOp::NotEqual => compare::CompareResult::NotEqual,
        }
    }
}

/// What a comparison looks at, and the operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Value(Vec<u8>),
    Version(i64),
    CreateRevision(i64),
    ModRevision(i64),
    Lease(i64),
}

/// One guard of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    key: Vec<u8>,
    range_end: Vec<u8>,
    op: CompareOp,
    target: CompareTarget,
}

impl Compare {
    pub fn new(key: impl Into<Vec<u8>>, op: CompareOp, target: CompareTarget) -> Self {
        Self {
            key: key.into(),
            range_end: Vec::new(),
            op,
            target,
        }
    }

    pub fn value(key: impl Into<Vec<u8>>, op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Self::new(key, op, CompareTarget::Value(value.into()))
    }

    pub fn version(key: impl Into<Vec<u8>>, op: CompareOp, version: i64) -> Self {
        Self::new(key, op, CompareTarget::Version(version))
    }

    pub fn create_revision(key: impl Into<Vec<u8>>, op: CompareOp, revision: i64) -> Self {
        Self::new(key, op, CompareTarget::CreateRevision(revision))
    }

    pub fn mod_revision(key: impl Into<Vec<u8>>, op: CompareOp, revision: i64) -> Self {
        Self::new(key, op, CompareTarget::ModRevision(revision))
    }

    pub fn lease(key: impl Into<Vec<u8>>, op: CompareOp, lease_id: i64) -> Self {
        Self::new(key, op, CompareTarget::Lease(lease_id))
    }

    /// Compare every key in `[key, end)`.
    pub fn with_range_end(mut self, end: impl Into<Vec<u8>>) -> Self {
        self.range_end = end.into();
        self
    }

    /// Compare every key with the compared key as prefix.
    pub fn with_prefix(mut self) -> Self {
        self.range_end = prefix_end(&self.key);
        self
    }

    fn to_proto(&self) -> proto::Compare {
        let (target, union) = match &self.target {
            CompareTarget::Value(v) => (
                compare::CompareTarget::Value,
                compare::TargetUnion::Value(v.clone()),
            ),
            CompareTarget::Version(v) => (
                compare::CompareTarget::Version,
                compare::TargetUnion::Version(*v),
            ),
            CompareTarget::CreateRevision(r) => (
                compare::CompareTarget::Create,
                compare::TargetUnion::CreateRevision(*r),
            ),
            CompareTarget::ModRevision(r) => (
                compare::CompareTarget::Mod,
                compare::TargetUnion::ModRevision(*r),
            ),
            CompareTarget::Lease(id) => (
                compare::CompareTarget::Lease,
                compare::TargetUnion::Lease(*id),
            ),
        };
        proto::Compare {
            result: compare::CompareResult::from(self.op) as i32,
            target: target as i32,
            key: self.key.clone(),
            target_union: Some(union),
            range_end: self.range_end.clone(),
        }
    }
}

/// One operation inside a transaction branch.
#[derive(Debug, Clone)]
pub enum Op {
    Get { key: Vec<u8>, options: GetOptions },
    Put { key: Vec<u8>, value: Vec<u8>, options: PutOptions },
    Delete { key: Vec<u8>, options: DeleteOptions },
    Txn(Box<Txn>),
}

impl Op {
    pub fn get(key: impl Into<Vec<u8>>, options: GetOptions) -> Self {
        Op::Get {
            key: key.into(),
            options,
        }
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, options: PutOptions) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>, options: DeleteOptions) -> Self {
        Op::Delete {
            key: key.into(),
            options,
        }
    }

    /// A nested transaction.
    pub fn txn(txn: Txn) -> Self {
        Op::Txn(Box::new(txn))
    }

    /// Whether executing this op can change the store.
    pub fn is_mutation(&self) -> bool {
        match self {
            Op::Get { .. } => false,
            Op::Put { .. } | Op::Delete { .. } => true,
            Op::Txn(txn) => !txn.is_read_only(),
        }
    }

    fn to_proto(&self) -> RequestOp {
        let request = match self {
            Op::Get { key, options } => request_op::Request::RequestRange(options.to_request(key)),
            Op::Put {
                key,
                value,
                options,
            } => request_op::Request::RequestPut(options.to_request(key, value)),
            Op::Delete { key, options } => {
                request_op::Request::RequestDeleteRange(options.to_request(key))
            }
            Op::Txn(txn) => request_op::Request::RequestTxn(txn.to_request()),
        };
        RequestOp {
            request: Some(request),
        }
    }
}

/// A transaction description.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    compares: Vec<Compare>,
    success: Vec<Op>,
    failure: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add guards; all must hold for the success branch to run.
    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    /// Ops run when every guard holds.
    pub fn and_then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.success.extend(ops);
        self
    }

    /// Ops run otherwise.
    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.failure.extend(ops);
        self
    }

    /// True when neither branch writes.
    pub fn is_read_only(&self) -> bool {
        !self
            .success
            .iter()
            .chain(self.failure.iter())
            .any(Op::is_mutation)
    }

    /// Wire form.
    pub fn to_request(&self) -> TxnRequest {
        TxnRequest {
            compare: self.compares.iter().map(Compare::to_proto).collect(),
            success: self.success.iter().map(Op::to_proto).collect(),
            failure: self.failure.iter().map(Op::to_proto).collect(),
        }
    }
}

/// A transaction bound to an executor, ready to commit.
#[derive(Debug)]
pub struct PendingTxn<'a> {
    executor: &'a UnaryExecutor,
    txn: Txn,
    options: TxnOptions,
}

impl<'a> PendingTxn<'a> {
    pub(crate) fn new(executor: &'a UnaryExecutor) -> Self {
        Self {
            executor,
            txn: Txn::new(),
            options: TxnOptions::default(),
        }
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.txn = self.txn.when(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.txn = self.txn.and_then(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.txn = self.txn.or_else(ops);
        self
    }

    pub fn with_options(mut self, options: TxnOptions) -> Self {
        self.options = options;
        self
    }

    /// Send the transaction.
    pub async fn commit(self) -> ClientResult<TxnResponse> {
        self.executor.txn(&self.txn, &self.options).await
    }
}
