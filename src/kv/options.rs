//! Per-operation options for key-value calls.

use super::iterate::DEFAULT_PAGE_SIZE;
use super::proto::{DeleteRangeRequest, PutRequest, RangeRequest, SortOrder, SortTarget};
use crate::core::time::CallOptions;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exclusive range end covering every key that starts with `prefix`.
///
/// The last byte below `0xff` is incremented and everything after it dropped.
/// A prefix made only of `0xff` bytes (or an empty prefix) has no finite end,
/// so the etcd "to the end of the keyspace" marker `[0]` is returned.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    match prefix.iter().rposition(|&b| b < 0xff) {
        Some(idx) => {
            let mut end = prefix[..=idx].to_vec();
            end[idx] += 1;
            end
        }
        None => vec![0],
    }
}

fn range_end_for(key: &[u8], range_end: &Option<Vec<u8>>, prefix: bool) -> Vec<u8> {
    if prefix {
        prefix_end(key)
    } else {
        range_end.clone().unwrap_or_default()
    }
}

macro_rules! call_option_builders {
    () => {
        /// Override the call deadline.
        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.call = self.call.with_timeout(timeout);
            self
        }

        /// Abort the call when `token` is cancelled.
        pub fn with_cancel(mut self, token: CancellationToken) -> Self {
            self.call = self.call.with_cancel(token);
            self
        }

        /// Replace the call options wholesale.
        pub fn with_call(mut self, call: CallOptions) -> Self {
            self.call = call;
            self
        }

        /// Deadline and cancellation for the call.
        pub fn call(&self) -> &CallOptions {
            &self.call
        }
    };
}

/// Options for a range read.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    range_end: Option<Vec<u8>>,
    prefix: bool,
    limit: i64,
    revision: i64,
    serializable: bool,
    keys_only: bool,
    count_only: bool,
    sort_order: SortOrder,
    sort_target: SortTarget,
    page_size: i64,
    call: CallOptions,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `[key, end)`.
    pub fn with_range_end(mut self, end: impl Into<Vec<u8>>) -> Self {
        self.range_end = Some(end.into());
        self.prefix = false;
        self
    }

    /// Read every key starting with the requested key.
    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Read at a historical revision.
    pub fn with_revision(mut self, revision: i64) -> Self {
        self.revision = revision;
        self
    }

    /// Serve from any member's local state instead of going through the leader.
    pub fn serializable(mut self) -> Self {
        self.serializable = true;
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    pub fn count_only(mut self) -> Self {
        self.count_only = true;
        self
    }

    pub fn with_sort(mut self, order: SortOrder, target: SortTarget) -> Self {
        self.sort_order = order;
        self.sort_target = target;
        self
    }

    /// Keys per page for paginated reads.
    pub fn with_page_size(mut self, size: i64) -> Self {
        self.page_size = size;
        self
    }

    call_option_builders!();

    pub fn is_serializable(&self) -> bool {
        self.serializable
    }

    pub fn page_size(&self) -> i64 {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }

    /// Build the wire request for `key`.
    pub fn to_request(&self, key: &[u8]) -> RangeRequest {
        RangeRequest {
            key: key.to_vec(),
            range_end: range_end_for(key, &self.range_end, self.prefix),
            limit: self.limit,
            revision: self.revision,
            sort_order: self.sort_order as i32,
            sort_target: self.sort_target as i32,
            serializable: self.serializable,
            keys_only: self.keys_only,
            count_only: self.count_only,
            ..RangeRequest::default()
        }
    }
}

/// Options for a put.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    lease: i64,
    prev_kv: bool,
    call: CallOptions,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the key to a lease.
    pub fn with_lease(mut self, lease_id: i64) -> Self {
        self.lease = lease_id;
        self
    }

    /// Return the previous key-value pair.
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    call_option_builders!();

    pub fn lease(&self) -> i64 {
        self.lease
    }

    pub fn to_request(&self, key: &[u8], value: &[u8]) -> PutRequest {
        PutRequest {
            key: key.to_vec(),
            value: value.to_vec(),
            lease: self.lease,
            prev_kv: self.prev_kv,
            ..PutRequest::default()
        }
    }
}

/// Options for a delete.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    range_end: Option<Vec<u8>>,
    prefix: bool,
    prev_kv: bool,
    call: CallOptions,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete `[key, end)`.
    pub fn with_range_end(mut self, end: impl Into<Vec<u8>>) -> Self {
        self.range_end = Some(end.into());
        self.prefix = false;
        self
    }

    /// Delete every key starting with the requested key.
    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    /// Return the deleted key-value pairs.
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    call_option_builders!();

    pub fn to_request(&self, key: &[u8]) -> DeleteRangeRequest {
        DeleteRangeRequest {
            key: key.to_vec(),
            range_end: range_end_for(key, &self.range_end, self.prefix),
            prev_kv: self.prev_kv,
        }
    }
}

/// Options for a transaction.
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    call: CallOptions,
}

impl TxnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    call_option_builders!();
}
