//! Tables: named keyspaces over one flat etcd keyspace.
//!
//! ```text
//!   \0tables\0<name>               registry marker (create revision = table id)
//!   \0table\0<name>\0<key>         data of <name>
//! ```
//!
//! A [`Table`] rewrites every key, range end, compare and nested transaction
//! into its namespace on the way out and strips the namespace from returned
//! keys on the way back. [`Tables`] creates, drops and lists the registry
//! markers with guarded transactions.

use super::executor::{require_key, CallKind, UnaryExecutor};
use super::iterate::{self, RangePages};
use super::options::{prefix_end, DeleteOptions, GetOptions, PutOptions, TxnOptions};
use super::proto::{
    self, request_op, response_op, DeleteRangeRequest, DeleteRangeResponse, KeyValue, PutRequest,
    PutResponse, RangeRequest, RangeResponse, TxnRequest, TxnResponse,
};
use super::txn::{Compare, CompareOp, Op, Txn};
use crate::core::error::{ClientError, ClientResult, GrpcCode, RpcStatus};
use crate::core::time::CallOptions;

const REGISTRY_PREFIX: &[u8] = b"\x00tables\x00";
const DATA_PREFIX: &[u8] = b"\x00table\x00";
const MAX_NAME_LEN: usize = 255;

fn validate_name(name: &str) -> ClientResult<()> {
    if name.is_empty() {
        return Err(ClientError::invalid_request("table name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ClientError::invalid_request(format!(
            "table name longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    if name.as_bytes().contains(&0) {
        return Err(ClientError::invalid_request(
            "table name must not contain NUL",
        ));
    }
    Ok(())
}

fn marker_key(name: &str) -> Vec<u8> {
    [REGISTRY_PREFIX, name.as_bytes()].concat()
}

/// A key prefix that scopes requests and unscopes responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: Vec<u8>,
}

impl Namespace {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Namespace holding the data of table `name`.
    pub fn for_table(name: &str) -> Self {
        Self::new([DATA_PREFIX, name.as_bytes(), b"\x00"].concat())
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn key(&self, key: &[u8]) -> Vec<u8> {
        [self.prefix.as_slice(), key].concat()
    }

    /// Map a range end. Empty (single key) stays empty; the open end `[0]`
    /// becomes the end of the namespace.
    pub fn range_end(&self, end: &[u8]) -> Vec<u8> {
        match end {
            [] => Vec::new(),
            [0] => prefix_end(&self.prefix),
            _ => self.key(end),
        }
    }

    fn strip(&self, key: &mut Vec<u8>) {
        if key.starts_with(&self.prefix) {
            key.drain(..self.prefix.len());
        }
    }

    fn unscope_kv(&self, kv: &mut KeyValue) {
        self.strip(&mut kv.key);
    }

    pub fn scope_range(&self, request: &mut RangeRequest) {
        request.range_end = self.range_end(&request.range_end);
        request.key = self.key(&request.key);
    }

    pub fn scope_put(&self, request: &mut PutRequest) {
        request.key = self.key(&request.key);
    }

    pub fn scope_delete(&self, request: &mut DeleteRangeRequest) {
        request.range_end = self.range_end(&request.range_end);
        request.key = self.key(&request.key);
    }

    pub fn scope_txn(&self, request: &mut TxnRequest) {
        for compare in &mut request.compare {
            compare.range_end = self.range_end(&compare.range_end);
            compare.key = self.key(&compare.key);
        }
        for op in request.success.iter_mut().chain(request.failure.iter_mut()) {
            match &mut op.request {
                Some(request_op::Request::RequestRange(r)) => self.scope_range(r),
                Some(request_op::Request::RequestPut(r)) => self.scope_put(r),
                Some(request_op::Request::RequestDeleteRange(r)) => self.scope_delete(r),
                Some(request_op::Request::RequestTxn(r)) => self.scope_txn(r),
                None => {}
            }
        }
    }

    pub fn unscope_range(&self, response: &mut RangeResponse) {
        response.kvs.iter_mut().for_each(|kv| self.unscope_kv(kv));
    }

    pub fn unscope_put(&self, response: &mut PutResponse) {
        if let Some(kv) = response.prev_kv.as_mut() {
            self.unscope_kv(kv);
        }
    }

    pub fn unscope_delete(&self, response: &mut DeleteRangeResponse) {
        response.prev_kvs.iter_mut().for_each(|kv| self.unscope_kv(kv));
    }

    pub fn unscope_txn(&self, response: &mut TxnResponse) {
        for op in &mut response.responses {
            match &mut op.response {
                Some(response_op::Response::ResponseRange(r)) => self.unscope_range(r),
                Some(response_op::Response::ResponsePut(r)) => self.unscope_put(r),
                Some(response_op::Response::ResponseDeleteRange(r)) => self.unscope_delete(r),
                Some(response_op::Response::ResponseTxn(r)) => self.unscope_txn(r),
                None => {}
            }
        }
    }
}

/// Key-value operations confined to one table.
///
/// Keys written with a lease through a table are not recorded in the client's
/// attached-key bookkeeping.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    namespace: Namespace,
    executor: UnaryExecutor,
}

impl Table {
    pub fn new(name: &str, executor: UnaryExecutor) -> ClientResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            namespace: Namespace::for_table(name),
            executor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Read a key or range of this table.
    pub async fn get(
        &self,
        key: impl AsRef<[u8]>,
        options: GetOptions,
    ) -> ClientResult<RangeResponse> {
        let key = key.as_ref();
        require_key(key)?;
        let mut request = options.to_request(key);
        self.namespace.scope_range(&mut request);
        let mut response: RangeResponse = self
            .executor
            .unary(
                "table_get",
                proto::KV_RANGE,
                &request,
                read_kind(&options),
                options.call(),
            )
            .await?;
        self.namespace.unscope_range(&mut response);
        Ok(response)
    }

    /// Write a key of this table.
    pub async fn put(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        options: PutOptions,
    ) -> ClientResult<PutResponse> {
        let key = key.as_ref();
        require_key(key)?;
        let mut request = options.to_request(key, value.as_ref());
        self.namespace.scope_put(&mut request);
        let mut response: PutResponse = self
            .executor
            .unary(
                "table_put",
                proto::KV_PUT,
                &request,
                CallKind::Write,
                options.call(),
            )
            .await?;
        self.namespace.unscope_put(&mut response);
        Ok(response)
    }

    /// Delete a key or range of this table.
    pub async fn delete(
        &self,
        key: impl AsRef<[u8]>,
        options: DeleteOptions,
    ) -> ClientResult<DeleteRangeResponse> {
        let key = key.as_ref();
        require_key(key)?;
        let mut request = options.to_request(key);
        self.namespace.scope_delete(&mut request);
        let mut response: DeleteRangeResponse = self
            .executor
            .unary(
                "table_delete",
                proto::KV_DELETE_RANGE,
                &request,
                CallKind::Write,
                options.call(),
            )
            .await?;
        self.namespace.unscope_delete(&mut response);
        Ok(response)
    }

    /// Commit a transaction whose keys all belong to this table.
    pub async fn txn(&self, txn: Txn, options: TxnOptions) -> ClientResult<TxnResponse> {
        let kind = if txn.is_read_only() {
            CallKind::Read
        } else {
            CallKind::Write
        };
        let mut request = txn.to_request();
        self.namespace.scope_txn(&mut request);
        let mut response: TxnResponse = self
            .executor
            .unary("table_txn", proto::KV_TXN, &request, kind, options.call())
            .await?;
        self.namespace.unscope_txn(&mut response);
        Ok(response)
    }

    /// Read a range of this table page by page.
    pub fn iterate(&self, key: impl AsRef<[u8]>, options: GetOptions) -> ClientResult<RangePages> {
        let key = key.as_ref();
        require_key(key)?;
        let mut request = options.to_request(key);
        self.namespace.scope_range(&mut request);
        iterate::pages(
            self.executor.clone(),
            request,
            read_kind(&options),
            options.call().clone(),
            options.page_size(),
            Some(self.namespace.clone()),
        )
    }
}

fn read_kind(options: &GetOptions) -> CallKind {
    if options.is_serializable() {
        CallKind::LocalRead
    } else {
        CallKind::Read
    }
}

/// A registered table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Revision at which the table was created.
    pub id: i64,
    pub name: String,
}

/// Table administration.
#[derive(Debug, Clone)]
pub struct Tables {
    executor: UnaryExecutor,
}

impl Tables {
    pub fn new(executor: UnaryExecutor) -> Self {
        Self { executor }
    }

    /// Register a table. Fails with `AlreadyExists` when the name is taken.
    pub async fn create(&self, name: &str, call: CallOptions) -> ClientResult<TableInfo> {
        validate_name(name)?;
        let marker = marker_key(name);
        let txn = Txn::new()
            .when([Compare::create_revision(marker.clone(), CompareOp::Equal, 0)])
            .and_then([Op::put(marker, name, PutOptions::new())]);
        let response = self
            .executor
            .txn(&txn, &TxnOptions::new().with_call(call))
            .await?;
        if !response.succeeded {
            return Err(RpcStatus::new(
                GrpcCode::AlreadyExists,
                format!("table {} already exists", name),
            )
            .into());
        }
        let id = response.header.as_ref().map_or(0, |h| h.revision);
        tracing::info!(table = name, id, "table created");
        Ok(TableInfo {
            id,
            name: name.to_string(),
        })
    }

    /// Drop a table and every key in it. Fails with `NotFound` when the table
    /// does not exist.
    pub async fn delete(&self, name: &str, call: CallOptions) -> ClientResult<()> {
        validate_name(name)?;
        let marker = marker_key(name);
        let data = Namespace::for_table(name);
        let txn = Txn::new()
            .when([Compare::create_revision(marker.clone(), CompareOp::Greater, 0)])
            .and_then([
                Op::delete(marker, DeleteOptions::new()),
                Op::delete(data.prefix(), DeleteOptions::new().with_prefix()),
            ]);
        let response = self
            .executor
            .txn(&txn, &TxnOptions::new().with_call(call))
            .await?;
        if !response.succeeded {
            return Err(RpcStatus::new(
                GrpcCode::NotFound,
                format!("table {} not found", name),
            )
            .into());
        }
        tracing::info!(table = name, "table deleted");
        Ok(())
    }

    /// Every registered table, by name.
    pub async fn list(&self, call: CallOptions) -> ClientResult<Vec<TableInfo>> {
        let registry = Namespace::new(REGISTRY_PREFIX);
        let mut response = self
            .executor
            .get(
                REGISTRY_PREFIX,
                &GetOptions::new().with_prefix().with_call(call),
            )
            .await?;
        registry.unscope_range(&mut response);
        Ok(response
            .kvs
            .into_iter()
            .map(|kv| TableInfo {
                id: kv.create_revision,
                name: String::from_utf8_lossy(&kv.key).into_owned(),
            })
            .collect())
    }
}
