//! Key-value operations.
//!
//! - [`proto`] - etcd v3 wire messages
//! - [`options`] - Per-call options and prefix ranges
//! - [`txn`] - Transaction builder
//! - [`executor`] - Unary call executor
//! - [`iterate`] - Paginated range reads
//! - [`table`] - Table namespaces and administration

pub mod executor;
pub mod iterate;
pub mod options;
pub mod proto;
pub mod table;
pub mod txn;

pub use executor::{CallKind, UnaryExecutor};
pub use iterate::{RangePages, DEFAULT_PAGE_SIZE};
pub use options::{prefix_end, DeleteOptions, GetOptions, PutOptions, TxnOptions};
pub use proto::{
    DeleteRangeResponse, KeyValue, MemberListResponse, PutResponse, RangeResponse, SortOrder,
    SortTarget, TxnResponse,
};
pub use table::{Namespace, Table, TableInfo, Tables};
pub use txn::{Compare, CompareOp, CompareTarget, Op, PendingTxn, Txn};
