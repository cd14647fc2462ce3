//! Watch subscription state.
//!
//! A subscription remembers the key range and the resume token: the revision
//! of the last event handed to the consumer. Reconnects ask the server for
//! everything after that revision, and anything at or below it is dropped if
//! the server sends it again.

use crate::kv::options::prefix_end;
use crate::kv::proto::{self, Event, EventType, FilterType, KeyValue, WatchCreateRequest};

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    /// First stream not yet established.
    Connecting,
    /// Stream established and delivering.
    Streaming,
    /// Stream lost; re-establishing from the resume token.
    Reconnecting,
    /// Terminal.
    Closed,
}

bitflags::bitflags! {
    /// Event filters for a watch stream.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WatchFilters: u32 {
        /// Filter out PUT events.
        const NOPUT = 0b0000_0001;
        /// Filter out DELETE events.
        const NODELETE = 0b0000_0010;
    }
}

impl Default for WatchFilters {
    fn default() -> Self {
        Self::empty()
    }
}

impl WatchFilters {
    fn to_wire(self) -> Vec<i32> {
        let mut out = Vec::new();
        if self.contains(WatchFilters::NOPUT) {
            out.push(FilterType::Noput as i32);
        }
        if self.contains(WatchFilters::NODELETE) {
            out.push(FilterType::Nodelete as i32);
        }
        out
    }
}

/// Options for a watch.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    range_end: Option<Vec<u8>>,
    prefix: bool,
    start_revision: i64,
    prev_kv: bool,
    progress_notify: bool,
    filters: WatchFilters,
    buffer_size: Option<usize>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `[key, end)`.
    pub fn with_range_end(mut self, end: impl Into<Vec<u8>>) -> Self {
        self.range_end = Some(end.into());
        self.prefix = false;
        self
    }

    /// Watch every key starting with the watched key.
    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    /// Start from `revision` instead of "now".
    pub fn with_start_revision(mut self, revision: i64) -> Self {
        self.start_revision = revision;
        self
    }

    /// Include the previous value in events.
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    /// Ask the server for periodic progress notifications.
    pub fn with_progress_notify(mut self) -> Self {
        self.progress_notify = true;
        self
    }

    pub fn with_filters(mut self, filters: WatchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Events buffered for the consumer before the stream task waits.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size.max(1));
        self
    }

    pub fn buffer_size(&self) -> Option<usize> {
        self.buffer_size
    }
}

/// Kind of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change delivered by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl WatchEvent {
    /// Revision at which the change happened.
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }

    pub fn key(&self) -> &[u8] {
        &self.kv.key
    }
}

impl From<Event> for WatchEvent {
    fn from(event: Event) -> Self {
        let kind = match EventType::try_from(event.r#type) {
            Ok(EventType::Delete) => EventKind::Delete,
            _ => EventKind::Put,
        };
        Self {
            kind,
            kv: event.kv.unwrap_or_default(),
            prev_kv: event.prev_kv,
        }
    }
}

/// Subscription state carried across reconnects.
#[derive(Debug, Clone)]
pub struct WatchState {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    pub filters: WatchFilters,
    pub prev_kv: bool,
    pub progress_notify: bool,
    /// Initial start revision; 0 means "from now".
    pub start_revision: i64,
    /// Resume token: revision of the last delivered event, or of the last
    /// point the server confirmed. 0 until known.
    pub last_revision: i64,
}

impl WatchState {
    pub fn new(key: Vec<u8>, options: &WatchOptions) -> Self {
        let range_end = if options.prefix {
            prefix_end(&key)
        } else {
            options.range_end.clone().unwrap_or_default()
        };
        Self {
            key,
            range_end,
            filters: options.filters,
            prev_kv: options.prev_kv,
            progress_notify: options.progress_notify,
            start_revision: options.start_revision,
            last_revision: options.start_revision.saturating_sub(1).max(0),
        }
    }

    /// Revision the next create request starts from.
    pub fn next_start_revision(&self) -> i64 {
        if self.last_revision > 0 {
            self.last_revision + 1
        } else {
            self.start_revision
        }
    }

    /// Create request for (re)subscribing.
    pub fn create_request(&self) -> proto::WatchRequest {
        proto::WatchRequest {
            request_union: Some(proto::watch_request::RequestUnion::CreateRequest(
                WatchCreateRequest {
                    key: self.key.clone(),
                    range_end: self.range_end.clone(),
                    start_revision: self.next_start_revision(),
                    progress_notify: self.progress_notify,
                    filters: self.filters.to_wire(),
                    prev_kv: self.prev_kv,
                    ..WatchCreateRequest::default()
                },
            )),
        }
    }

    /// The server confirmed the watch at `header_revision`.
    ///
    /// A watch started "from now" pins its resume point here so a reconnect
    /// does not skip events that happen while disconnected.
    pub fn on_created(&mut self, header_revision: i64) {
        if self.last_revision == 0 && self.start_revision == 0 {
            self.last_revision = header_revision.max(0);
        }
    }

    /// Progress notification: everything up to `revision` has been seen.
    pub fn on_progress(&mut self, revision: i64) {
        if revision > self.last_revision {
            self.last_revision = revision;
        }
    }

    /// Filter one response batch down to events not yet delivered, advancing
    /// the resume token.
    ///
    /// Events sharing a revision (one transaction) arrive in the same batch, so
    /// the duplicate check is against the token as it stood before the batch.
    pub fn accept_batch(&mut self, events: Vec<Event>) -> Vec<WatchEvent> {
        let floor = self.last_revision;
        let mut accepted = Vec::with_capacity(events.len());
        for event in events.into_iter().map(WatchEvent::from) {
            let revision = event.revision();
            if revision <= floor || revision < self.last_revision {
                continue;
            }
            self.last_revision = revision;
            accepted.push(event);
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str, rev: i64) -> Event {
        Event {
            r#type: EventType::Put as i32,
            kv: Some(KeyValue {
                key: key.as_bytes().to_vec(),
                mod_revision: rev,
                ..KeyValue::default()
            }),
            prev_kv: None,
        }
    }

    #[test]
    fn test_prefix_range() {
        let state = WatchState::new(b"app/".to_vec(), &WatchOptions::new().with_prefix());
        assert_eq!(state.range_end, b"app0".to_vec());
    }

    #[test]
    fn test_resume_point() {
        let mut state = WatchState::new(b"a".to_vec(), &WatchOptions::new());
        assert_eq!(state.next_start_revision(), 0);
        state.on_created(41);
        assert_eq!(state.next_start_revision(), 42);

        let state = WatchState::new(b"a".to_vec(), &WatchOptions::new().with_start_revision(5));
        assert_eq!(state.last_revision, 4);
        assert_eq!(state.next_start_revision(), 5);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut state = WatchState::new(b"a".to_vec(), &WatchOptions::new().with_start_revision(5));
        let first = state.accept_batch(vec![event("a", 5), event("b", 6), event("c", 7)]);
        assert_eq!(first.len(), 3);
        assert_eq!(state.last_revision, 7);

        let replay = state.accept_batch(vec![event("b", 6), event("c", 7), event("d", 8)]);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].revision(), 8);
    }

    #[test]
    fn test_same_revision_batch_kept_whole() {
        let mut state = WatchState::new(b"a".to_vec(), &WatchOptions::new().with_prefix());
        state.on_created(9);
        let batch = state.accept_batch(vec![event("a1", 10), event("a2", 10)]);
        assert_eq!(batch.len(), 2);
        assert_eq!(state.last_revision, 10);
    }

    #[test]
    fn test_progress_never_moves_backwards() {
        let mut state = WatchState::new(b"a".to_vec(), &WatchOptions::new());
        state.on_progress(20);
        state.on_progress(15);
        assert_eq!(state.last_revision, 20);
    }

    #[test]
    fn test_filters_on_wire() {
        let state = WatchState::new(
            b"a".to_vec(),
            &WatchOptions::new().with_filters(WatchFilters::NOPUT | WatchFilters::NODELETE),
        );
        match state.create_request().request_union {
            Some(proto::watch_request::RequestUnion::CreateRequest(create)) => {
                assert_eq!(create.filters, vec![0, 1]);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }
}
