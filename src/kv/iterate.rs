//! Paginated range reads.
//!
//! A range too large for one response is read page by page. Every page is its
//! own unary call through the policy engine (retried, redirected and bounded
//! like any read), pinned to the revision of the first page so the pages form
//! one consistent snapshot.
//!
//! ```text
//!   page 1: [key, end)         limit=n  revision=0  ──► header.revision = R
//!   page 2: [last ++ \0, end)  limit=n  revision=R
//!   ...                                   until more == false
//! ```

use super::executor::{CallKind, UnaryExecutor};
use super::proto::{self, RangeRequest, RangeResponse, SortOrder, SortTarget};
use super::table::Namespace;
use crate::core::error::{ClientError, ClientResult};
use crate::core::time::CallOptions;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Keys per page when the caller does not choose.
pub const DEFAULT_PAGE_SIZE: i64 = 500;

/// Pages of a range read, in key order.
///
/// Ends after the last page or after the first error.
pub type RangePages = BoxStream<'static, ClientResult<RangeResponse>>;

struct Cursor {
    executor: UnaryExecutor,
    request: RangeRequest,
    kind: CallKind,
    call: CallOptions,
    page_size: i64,
    /// Keys the caller's limit still allows; `None` is unlimited.
    remaining: Option<i64>,
    namespace: Option<Namespace>,
    done: bool,
}

/// Read `request` page by page. `namespace` strips a table prefix from the
/// returned keys.
pub fn pages(
    executor: UnaryExecutor,
    request: RangeRequest,
    kind: CallKind,
    call: CallOptions,
    page_size: i64,
    namespace: Option<Namespace>,
) -> ClientResult<RangePages> {
    if page_size <= 0 {
        return Err(ClientError::invalid_request("page size must be positive"));
    }
    if request.sort_order == SortOrder::Descend as i32
        || request.sort_target != SortTarget::Key as i32
    {
        return Err(ClientError::invalid_request(
            "paginated reads are ordered by key, ascending",
        ));
    }
    let remaining = (request.limit > 0).then_some(request.limit);
    let cursor = Cursor {
        executor,
        request,
        kind,
        call,
        page_size,
        remaining,
        namespace,
        done: false,
    };
    Ok(futures::stream::try_unfold(cursor, next_page).boxed())
}

async fn next_page(mut cursor: Cursor) -> ClientResult<Option<(RangeResponse, Cursor)>> {
    if cursor.done {
        return Ok(None);
    }
    let mut request = cursor.request.clone();
    request.limit = match cursor.remaining {
        Some(left) => left.min(cursor.page_size),
        None => cursor.page_size,
    };
    let mut page: RangeResponse = cursor
        .executor
        .unary("iterate", proto::KV_RANGE, &request, cursor.kind, &cursor.call)
        .await?;

    if cursor.request.revision == 0 {
        cursor.request.revision = page.header.as_ref().map_or(0, |h| h.revision);
    }
    if let Some(left) = cursor.remaining.as_mut() {
        *left -= page.kvs.len() as i64;
    }
    let last = page.kvs.last().map(|kv| kv.key.clone());
    cursor.done = !page.more
        || request.count_only
        || cursor.request.range_end.is_empty()
        || cursor.remaining.is_some_and(|left| left <= 0);
    match last {
        Some(mut key) => {
            key.push(0);
            cursor.request.key = key;
        }
        None => cursor.done = true,
    }
    tracing::trace!(
        keys = page.kvs.len(),
        revision = cursor.request.revision,
        more = !cursor.done,
        "range page read"
    );

    if let Some(namespace) = &cursor.namespace {
        namespace.unscope_range(&mut page);
    }
    Ok(Some((page, cursor)))
}
