//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.
//!
//! [`MockCluster`] is an in-memory etcd-like cluster behind the client's
//! [`Connector`] seam: a revisioned key-value store, watch streams, leases and
//! a member list, plus knobs to script failures per address.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use lattice_client::core::error::{ClientError, ClientResult, GrpcCode, RpcStatus};
use lattice_client::kv::proto::{
    self, compare, request_op, response_op, watch_request, DeleteRangeRequest,
    DeleteRangeResponse, Event, EventType, KeyValue, LeaseGrantRequest, LeaseGrantResponse,
    LeaseKeepAliveRequest, LeaseKeepAliveResponse, LeaseRevokeRequest, LeaseRevokeResponse,
    LeaseTimeToLiveRequest, LeaseTimeToLiveResponse, Member, MemberListResponse, PutRequest,
    PutResponse, RangeRequest, RangeResponse, RequestOp, ResponseHeader, ResponseOp, TxnRequest,
    TxnResponse, WatchCreateRequest, WatchRequest, WatchResponse,
};
use lattice_client::net::compression::{CodecRegistry, SnappyCodec};
use lattice_client::net::tls::SecurityContext;
use lattice_client::net::transport::{Connector, RpcChannel, RpcStream, UnaryReply, WireMessage};
use lattice_client::ClientBuilder;
use parking_lot::Mutex;
use prost::Message;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Buffer of every server-to-client stream.
const STREAM_BUFFER: usize = 256;

// ============================================================================
// Config files
// ============================================================================

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    write_config(
        r#"
endpoints = ["10.0.0.1:2379"]
"#,
    )
}

/// Write `content` to a temporary config file.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

// ============================================================================
// Mock cluster
// ============================================================================

/// One request seen by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub address: String,
    pub path: &'static str,
    /// Encoding of the request payload; `None` means uncompressed.
    pub encoding: Option<String>,
}

#[derive(Debug, Clone)]
struct MockLease {
    granted_ttl: i64,
    keys: HashSet<Vec<u8>>,
}

struct Watcher {
    id: u64,
    key: Vec<u8>,
    range_end: Vec<u8>,
    sender: mpsc::Sender<ClientResult<WireMessage>>,
}

struct ClusterState {
    members: Vec<String>,
    leader: Option<String>,
    unreachable: HashSet<String>,
    scripted: HashMap<String, VecDeque<ClientError>>,
    advertised: HashMap<String, Vec<String>>,
    latency: HashMap<String, Duration>,
    corrupt: HashSet<String>,
    connects: Vec<(String, String)>,
    calls: Vec<CallRecord>,
    ranges: Vec<RangeRequest>,

    revision: i64,
    compact_revision: i64,
    kv: BTreeMap<Vec<u8>, KeyValue>,
    history: Vec<Event>,

    watchers: Vec<Watcher>,
    next_watcher: u64,
    watch_creates: Vec<WatchCreateRequest>,
    replay_overlap: i64,

    leases: HashMap<i64, MockLease>,
    next_lease: i64,
    keep_alive_fail: bool,
    keep_alives: usize,
    keep_alive_latency: Duration,
    keep_alives_in_flight: usize,
    max_keep_alives_in_flight: usize,
}

/// An in-memory cluster reachable through [`MockCluster::connector`].
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
    codecs: Arc<CodecRegistry>,
}

impl MockCluster {
    /// A cluster with the given member addresses and no known leader.
    pub fn new(members: &[&str]) -> Self {
        let mut codecs = CodecRegistry::new();
        codecs.register("snappy", 1, SnappyCodec, SnappyCodec);
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                members: members.iter().map(|m| m.to_string()).collect(),
                leader: None,
                unreachable: HashSet::new(),
                scripted: HashMap::new(),
                advertised: HashMap::new(),
                latency: HashMap::new(),
                corrupt: HashSet::new(),
                connects: Vec::new(),
                calls: Vec::new(),
                ranges: Vec::new(),
                revision: 1,
                compact_revision: 0,
                kv: BTreeMap::new(),
                history: Vec::new(),
                watchers: Vec::new(),
                next_watcher: 1,
                watch_creates: Vec::new(),
                replay_overlap: 0,
                leases: HashMap::new(),
                next_lease: 1000,
                keep_alive_fail: false,
                keep_alives: 0,
                keep_alive_latency: Duration::ZERO,
                keep_alives_in_flight: 0,
                max_keep_alives_in_flight: 0,
            })),
            codecs: Arc::new(codecs),
        }
    }

    /// Connector handing out channels to this cluster.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            cluster: self.clone(),
        })
    }

    /// Client builder wired to this cluster with a short, jitter-free backoff.
    pub fn builder(&self) -> ClientBuilder {
        let members = self.state.lock().members.clone();
        ClientBuilder::new()
            .endpoints(members)
            .connector(self.connector())
            .backoff(Duration::from_millis(10), 2.0, Duration::from_millis(100))
            .jitter(0.0)
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Only `leader` accepts writes; followers answer "not leader" with a hint.
    pub fn set_leader(&self, leader: Option<&str>) {
        self.state.lock().leader = leader.map(str::to_string);
    }

    /// Make `address` refuse connections and calls.
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(address.to_string());
        } else {
            state.unreachable.remove(address);
        }
    }

    /// Fail the next `count` requests to `address` with `err`.
    pub fn fail_next(&self, address: &str, err: ClientError, count: usize) {
        let mut state = self.state.lock();
        let queue = state.scripted.entry(address.to_string()).or_default();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    /// Encodings `address` advertises in its replies.
    pub fn advertise(&self, address: &str, encodings: &[&str]) {
        self.state.lock().advertised.insert(
            address.to_string(),
            encodings.iter().map(|e| e.to_string()).collect(),
        );
    }

    /// Delay every unary reply from `address`.
    pub fn set_latency(&self, address: &str, latency: Duration) {
        self.state
            .lock()
            .latency
            .insert(address.to_string(), latency);
    }

    /// Reply from `address` with a payload that fails to decompress.
    pub fn corrupt_replies(&self, address: &str) {
        self.state.lock().corrupt.insert(address.to_string());
    }

    /// Connections opened so far, as (address, security profile).
    pub fn connects(&self) -> Vec<(String, String)> {
        self.state.lock().connects.clone()
    }

    /// Every request seen so far.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().calls.clone()
    }

    /// Requests on `path`, in order.
    pub fn calls_to(&self, path: &str) -> Vec<CallRecord> {
        self.calls().into_iter().filter(|c| c.path == path).collect()
    }

    /// Add a member advertised by the member list.
    pub fn add_member(&self, address: &str) {
        self.state.lock().members.push(address.to_string());
    }

    // ------------------------------------------------------------------------
    // Key-value
    // ------------------------------------------------------------------------

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Write directly on the server side, notifying watchers.
    pub fn put(&self, key: &str, value: &str) -> i64 {
        let mut state = self.state.lock();
        let revision = state.revision + 1;
        let mut events = Vec::new();
        state.apply_put(key.as_bytes(), value.as_bytes(), 0, revision, &mut events);
        state.commit(revision, events);
        revision
    }

    /// Value currently stored under `key`.
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .kv
            .get(key.as_bytes())
            .map(|kv| kv.value.clone())
    }

    /// Every key currently stored, in order.
    pub fn raw_keys(&self) -> Vec<Vec<u8>> {
        self.state.lock().kv.keys().cloned().collect()
    }

    /// Range requests served so far.
    pub fn range_requests(&self) -> Vec<RangeRequest> {
        self.state.lock().ranges.clone()
    }

    /// Discard history up to and including `revision`.
    pub fn compact(&self, revision: i64) {
        let mut state = self.state.lock();
        state.compact_revision = revision;
        state
            .history
            .retain(|e| e.kv.as_ref().map_or(0, |kv| kv.mod_revision) > revision);
    }

    // ------------------------------------------------------------------------
    // Watch
    // ------------------------------------------------------------------------

    /// Break every open watch stream with a transport error.
    pub fn disconnect_watchers(&self) {
        let watchers: Vec<Watcher> = self.state.lock().watchers.drain(..).collect();
        for watcher in watchers {
            let _ = watcher
                .sender
                .try_send(Err(ClientError::transient("connection reset")));
        }
    }

    /// Replay this many revisions before the requested start on (re)create,
    /// as a server with a stale view would.
    pub fn set_replay_overlap(&self, revisions: i64) {
        self.state.lock().replay_overlap = revisions;
    }

    /// Create requests received, in order.
    pub fn watch_creates(&self) -> Vec<WatchCreateRequest> {
        self.state.lock().watch_creates.clone()
    }

    /// Watch streams currently registered.
    pub fn open_watchers(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|w| !w.sender.is_closed());
        state.watchers.len()
    }

    // ------------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------------

    /// Refuse keep-alive streams.
    pub fn fail_keep_alives(&self, fail: bool) {
        self.state.lock().keep_alive_fail = fail;
    }

    /// Keep-alive requests answered.
    pub fn keep_alive_count(&self) -> usize {
        self.state.lock().keep_alives
    }

    /// Delay every keep-alive reply.
    pub fn set_keep_alive_latency(&self, latency: Duration) {
        self.state.lock().keep_alive_latency = latency;
    }

    /// Highest number of keep-alive requests being served at once.
    pub fn max_concurrent_keep_alives(&self) -> usize {
        self.state.lock().max_keep_alives_in_flight
    }

    /// Whether the server still holds `lease_id`.
    pub fn has_lease(&self, lease_id: i64) -> bool {
        self.state.lock().leases.contains_key(&lease_id)
    }

    /// Expire a lease on the server side, deleting its keys.
    pub fn expire_lease(&self, lease_id: i64) {
        let mut state = self.state.lock();
        state.drop_lease(lease_id);
    }

    // ------------------------------------------------------------------------
    // Request handling
    // ------------------------------------------------------------------------

    fn admit(&self, address: &str, path: &'static str, encoding: Option<String>) -> ClientResult<()> {
        let mut state = self.state.lock();
        if state.unreachable.contains(address) {
            return Err(ClientError::unreachable(address, "connection refused"));
        }
        state.calls.push(CallRecord {
            address: address.to_string(),
            path,
            encoding,
        });
        if let Some(err) = state.scripted.get_mut(address).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        if leader_only(path) {
            if let Some(leader) = state.leader.clone() {
                if leader != address {
                    return Err(RpcStatus::new(GrpcCode::Unavailable, "etcdserver: not leader")
                        .with_leader_hint(leader)
                        .into());
                }
            }
        }
        Ok(())
    }

    fn reply<M: Message>(&self, address: &str, msg: &M, codec: Option<&str>) -> ClientResult<UnaryReply> {
        let (accept_encoding, corrupt) = {
            let state = self.state.lock();
            let advertised = state
                .advertised
                .get(address)
                .cloned()
                .unwrap_or_else(|| vec!["identity".to_string()]);
            (advertised, state.corrupt.contains(address))
        };
        if corrupt {
            return Ok(UnaryReply {
                message: WireMessage {
                    payload: vec![0xde, 0xad, 0xbe, 0xef].into(),
                    encoding: Some("snappy".to_string()),
                },
                accept_encoding,
            });
        }
        Ok(UnaryReply {
            message: WireMessage::encode(msg, codec, &self.codecs)?,
            accept_encoding,
        })
    }

    fn handle_unary(
        &self,
        address: &str,
        path: &'static str,
        request: &WireMessage,
    ) -> ClientResult<UnaryReply> {
        self.admit(address, path, request.encoding.clone())?;
        let codec = request.encoding.as_deref();
        match path {
            proto::KV_RANGE => {
                let req: RangeRequest = request.decode(&self.codecs)?;
                let mut state = self.state.lock();
                state.ranges.push(req.clone());
                let resp = state.range(&req);
                drop(state);
                self.reply(address, &resp, codec)
            }
            proto::KV_PUT => {
                let req: PutRequest = request.decode(&self.codecs)?;
                let resp = self.state.lock().put_request(&req)?;
                self.reply(address, &resp, codec)
            }
            proto::KV_DELETE_RANGE => {
                let req: DeleteRangeRequest = request.decode(&self.codecs)?;
                let resp = self.state.lock().delete_request(&req);
                self.reply(address, &resp, codec)
            }
            proto::KV_TXN => {
                let req: TxnRequest = request.decode(&self.codecs)?;
                let resp = self.state.lock().txn_request(&req)?;
                self.reply(address, &resp, codec)
            }
            proto::LEASE_GRANT => {
                let req: LeaseGrantRequest = request.decode(&self.codecs)?;
                let resp = self.state.lock().grant(&req)?;
                self.reply(address, &resp, codec)
            }
            proto::LEASE_REVOKE => {
                let req: LeaseRevokeRequest = request.decode(&self.codecs)?;
                let mut state = self.state.lock();
                if !state.leases.contains_key(&req.id) {
                    return Err(RpcStatus::new(
                        GrpcCode::NotFound,
                        "etcdserver: requested lease not found",
                    )
                    .into());
                }
                state.drop_lease(req.id);
                let resp = LeaseRevokeResponse {
                    header: Some(state.header()),
                };
                drop(state);
                self.reply(address, &resp, codec)
            }
            proto::LEASE_TIME_TO_LIVE => {
                let req: LeaseTimeToLiveRequest = request.decode(&self.codecs)?;
                let state = self.state.lock();
                let resp = match state.leases.get(&req.id) {
                    Some(lease) => LeaseTimeToLiveResponse {
                        header: Some(state.header()),
                        id: req.id,
                        ttl: lease.granted_ttl,
                        granted_ttl: lease.granted_ttl,
                        keys: if req.keys {
                            lease.keys.iter().cloned().collect()
                        } else {
                            Vec::new()
                        },
                    },
                    None => LeaseTimeToLiveResponse {
                        header: Some(state.header()),
                        id: req.id,
                        ttl: -1,
                        ..LeaseTimeToLiveResponse::default()
                    },
                };
                drop(state);
                self.reply(address, &resp, codec)
            }
            proto::CLUSTER_MEMBER_LIST => {
                let state = self.state.lock();
                let resp = MemberListResponse {
                    header: Some(state.header()),
                    members: state
                        .members
                        .iter()
                        .enumerate()
                        .map(|(idx, addr)| Member {
                            id: idx as u64 + 1,
                            name: format!("member-{}", idx + 1),
                            peer_urls: Vec::new(),
                            client_urls: vec![format!("http://{}", addr)],
                            is_learner: false,
                        })
                        .collect(),
                };
                drop(state);
                self.reply(address, &resp, codec)
            }
            other => Err(RpcStatus::new(
                GrpcCode::Unimplemented,
                format!("unknown method {}", other),
            )
            .into()),
        }
    }

    fn open_watch(&self, address: &str, declared: Option<String>) -> RpcStream {
        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(16);
        let (in_tx, in_rx) = mpsc::channel::<ClientResult<WireMessage>>(STREAM_BUFFER);
        let cluster = self.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let Some(first) = out_rx.recv().await else {
                return;
            };
            if let Err(err) = check_stream_encoding(&first, &declared) {
                let _ = in_tx.send(Err(err)).await;
                return;
            }
            let codec = first.encoding.clone();
            let create = match first.decode::<WatchRequest>(&cluster.codecs) {
                Ok(WatchRequest {
                    request_union: Some(watch_request::RequestUnion::CreateRequest(create)),
                }) => create,
                _ => return,
            };
            let watcher_id = cluster.register_watch(create, in_tx, codec);
            while out_rx.recv().await.is_some() {}
            cluster
                .state
                .lock()
                .watchers
                .retain(|w| w.id != watcher_id);
            tracing::trace!(address = %address, watcher_id, "watch stream closed by client");
        });
        RpcStream {
            outbound: out_tx,
            inbound: ReceiverStream::new(in_rx).boxed(),
        }
    }

    fn register_watch(
        &self,
        create: WatchCreateRequest,
        sender: mpsc::Sender<ClientResult<WireMessage>>,
        codec: Option<String>,
    ) -> u64 {
        let mut state = self.state.lock();
        state.watch_creates.push(create.clone());
        let id = state.next_watcher;
        state.next_watcher += 1;

        let send = |msg: &WatchResponse| {
            if let Ok(wire) = WireMessage::encode(msg, codec.as_deref(), &self.codecs) {
                let _ = sender.try_send(Ok(wire));
            }
        };

        let start = create.start_revision;
        if start > 0 && start <= state.compact_revision {
            send(&WatchResponse {
                header: Some(state.header()),
                watch_id: id as i64,
                created: true,
                canceled: true,
                compact_revision: state.compact_revision,
                ..WatchResponse::default()
            });
            return id;
        }

        send(&WatchResponse {
            header: Some(state.header()),
            watch_id: id as i64,
            created: true,
            ..WatchResponse::default()
        });

        if start > 0 {
            let from = (start - state.replay_overlap).max(1);
            let replay: Vec<Event> = state
                .history
                .iter()
                .filter(|e| {
                    e.kv.as_ref().is_some_and(|kv| {
                        kv.mod_revision >= from && in_range(&kv.key, &create.key, &create.range_end)
                    })
                })
                .cloned()
                .collect();
            for batch in group_by_revision(replay) {
                send(&WatchResponse {
                    header: Some(state.header()),
                    watch_id: id as i64,
                    events: batch,
                    ..WatchResponse::default()
                });
            }
        }

        state.watchers.push(Watcher {
            id,
            key: create.key,
            range_end: create.range_end,
            sender: sender.clone(),
        });
        drop(state);
        id
    }

    fn open_keep_alive(&self, declared: Option<String>) -> ClientResult<RpcStream> {
        if self.state.lock().keep_alive_fail {
            return Err(ClientError::transient("lease stream unavailable"));
        }
        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(16);
        let (in_tx, in_rx) = mpsc::channel::<ClientResult<WireMessage>>(STREAM_BUFFER);
        let cluster = self.clone();
        tokio::spawn(async move {
            while let Some(wire) = out_rx.recv().await {
                if let Err(err) = check_stream_encoding(&wire, &declared) {
                    let _ = in_tx.send(Err(err)).await;
                    break;
                }
                let Ok(req) = wire.decode::<LeaseKeepAliveRequest>(&cluster.codecs) else {
                    break;
                };
                let latency = {
                    let mut state = cluster.state.lock();
                    state.keep_alives_in_flight += 1;
                    state.max_keep_alives_in_flight =
                        state.max_keep_alives_in_flight.max(state.keep_alives_in_flight);
                    state.keep_alive_latency
                };
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                let resp = {
                    let mut state = cluster.state.lock();
                    state.keep_alives += 1;
                    state.keep_alives_in_flight -= 1;
                    let ttl = state.leases.get(&req.id).map_or(0, |l| l.granted_ttl);
                    LeaseKeepAliveResponse {
                        header: Some(state.header()),
                        id: req.id,
                        ttl,
                    }
                };
                let Ok(reply) = WireMessage::encode(&resp, wire.encoding.as_deref(), &cluster.codecs)
                else {
                    break;
                };
                if in_tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
        });
        Ok(RpcStream {
            outbound: out_tx,
            inbound: ReceiverStream::new(in_rx).boxed(),
        })
    }
}

/// A server only accepts compressed frames on a stream that declared their codec.
fn check_stream_encoding(msg: &WireMessage, declared: &Option<String>) -> ClientResult<()> {
    if msg.encoding == *declared {
        return Ok(());
    }
    Err(RpcStatus::new(
        GrpcCode::Internal,
        format!(
            "message encoded with {:?} on a stream declaring {:?}",
            msg.encoding, declared
        ),
    )
    .into())
}

fn leader_only(path: &str) -> bool {
    matches!(
        path,
        proto::KV_PUT
            | proto::KV_DELETE_RANGE
            | proto::KV_TXN
            | proto::LEASE_GRANT
            | proto::LEASE_REVOKE
            | proto::LEASE_KEEP_ALIVE
    )
}

fn in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    if end.is_empty() {
        return key == start;
    }
    if end == [0] {
        return key >= start;
    }
    key >= start && key < end
}

fn group_by_revision(events: Vec<Event>) -> Vec<Vec<Event>> {
    let mut batches: Vec<Vec<Event>> = Vec::new();
    for event in events {
        let revision = event.kv.as_ref().map_or(0, |kv| kv.mod_revision);
        let same_revision = batches
            .last()
            .and_then(|b| b.first())
            .and_then(|e| e.kv.as_ref())
            .is_some_and(|kv| kv.mod_revision == revision);
        match batches.last_mut() {
            Some(batch) if same_revision => batch.push(event),
            _ => batches.push(vec![event]),
        }
    }
    batches
}

impl ClusterState {
    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            cluster_id: 1,
            member_id: 1,
            revision: self.revision,
            raft_term: 1,
        }
    }

    fn range(&self, req: &RangeRequest) -> RangeResponse {
        let mut kvs: Vec<KeyValue> = self
            .kv
            .values()
            .filter(|kv| in_range(&kv.key, &req.key, &req.range_end))
            .cloned()
            .collect();
        let count = kvs.len() as i64;
        let more = req.limit > 0 && count > req.limit;
        if req.limit > 0 {
            kvs.truncate(req.limit as usize);
        }
        if req.keys_only {
            for kv in &mut kvs {
                kv.value.clear();
            }
        }
        if req.count_only {
            kvs.clear();
        }
        RangeResponse {
            header: Some(self.header()),
            kvs,
            more,
            count,
        }
    }

    fn apply_put(
        &mut self,
        key: &[u8],
        value: &[u8],
        lease: i64,
        revision: i64,
        events: &mut Vec<Event>,
    ) -> Option<KeyValue> {
        let prev = self.kv.get(key).cloned();
        let kv = KeyValue {
            key: key.to_vec(),
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            value: value.to_vec(),
            lease,
        };
        if let Some(old) = prev.as_ref().filter(|p| p.lease != 0 && p.lease != lease) {
            if let Some(l) = self.leases.get_mut(&old.lease) {
                l.keys.remove(key);
            }
        }
        if lease != 0 {
            if let Some(l) = self.leases.get_mut(&lease) {
                l.keys.insert(key.to_vec());
            }
        }
        self.kv.insert(key.to_vec(), kv.clone());
        events.push(Event {
            r#type: EventType::Put as i32,
            kv: Some(kv),
            prev_kv: prev.clone(),
        });
        prev
    }

    fn apply_delete(
        &mut self,
        key: &[u8],
        range_end: &[u8],
        revision: i64,
        events: &mut Vec<Event>,
    ) -> Vec<KeyValue> {
        let doomed: Vec<Vec<u8>> = self
            .kv
            .keys()
            .filter(|k| in_range(k, key, range_end))
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for k in doomed {
            if let Some(prev) = self.kv.remove(&k) {
                if let Some(l) = self.leases.get_mut(&prev.lease) {
                    l.keys.remove(&k);
                }
                events.push(Event {
                    r#type: EventType::Delete as i32,
                    kv: Some(KeyValue {
                        key: k,
                        mod_revision: revision,
                        ..KeyValue::default()
                    }),
                    prev_kv: Some(prev.clone()),
                });
                removed.push(prev);
            }
        }
        removed
    }

    /// Publish the events of one revision.
    fn commit(&mut self, revision: i64, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.revision = revision;
        self.history.extend(events.iter().cloned());
        let header = self.header();
        self.watchers.retain(|w| !w.sender.is_closed());
        for watcher in &self.watchers {
            let batch: Vec<Event> = events
                .iter()
                .filter(|e| {
                    e.kv
                        .as_ref()
                        .is_some_and(|kv| in_range(&kv.key, &watcher.key, &watcher.range_end))
                })
                .cloned()
                .collect();
            if batch.is_empty() {
                continue;
            }
            let resp = WatchResponse {
                header: Some(header.clone()),
                watch_id: watcher.id as i64,
                events: batch,
                ..WatchResponse::default()
            };
            let _ = watcher
                .sender
                .try_send(Ok(WireMessage::plain(resp.encode_to_vec())));
        }
    }

    fn put_request(&mut self, req: &PutRequest) -> ClientResult<PutResponse> {
        if req.lease != 0 && !self.leases.contains_key(&req.lease) {
            return Err(RpcStatus::new(GrpcCode::NotFound, "etcdserver: requested lease not found").into());
        }
        let revision = self.revision + 1;
        let mut events = Vec::new();
        let prev = self.apply_put(&req.key, &req.value, req.lease, revision, &mut events);
        self.commit(revision, events);
        Ok(PutResponse {
            header: Some(self.header()),
            prev_kv: prev.filter(|_| req.prev_kv),
        })
    }

    fn delete_request(&mut self, req: &DeleteRangeRequest) -> DeleteRangeResponse {
        let revision = self.revision + 1;
        let mut events = Vec::new();
        let removed = self.apply_delete(&req.key, &req.range_end, revision, &mut events);
        self.commit(revision, events);
        DeleteRangeResponse {
            header: Some(self.header()),
            deleted: removed.len() as i64,
            prev_kvs: if req.prev_kv { removed } else { Vec::new() },
        }
    }

    fn txn_request(&mut self, req: &TxnRequest) -> ClientResult<TxnResponse> {
        let revision = self.revision + 1;
        let mut events = Vec::new();
        let resp = self.apply_txn(req, revision, &mut events)?;
        self.commit(revision, events);
        Ok(TxnResponse {
            header: Some(self.header()),
            ..resp
        })
    }

    fn apply_txn(
        &mut self,
        req: &TxnRequest,
        revision: i64,
        events: &mut Vec<Event>,
    ) -> ClientResult<TxnResponse> {
        let succeeded = req.compare.iter().all(|c| self.evaluate(c));
        let ops = if succeeded { &req.success } else { &req.failure };
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            responses.push(self.apply_op(op, revision, events)?);
        }
        Ok(TxnResponse {
            header: None,
            succeeded,
            responses,
        })
    }

    fn apply_op(
        &mut self,
        op: &RequestOp,
        revision: i64,
        events: &mut Vec<Event>,
    ) -> ClientResult<ResponseOp> {
        let response = match &op.request {
            Some(request_op::Request::RequestRange(range)) => {
                response_op::Response::ResponseRange(self.range(range))
            }
            Some(request_op::Request::RequestPut(put)) => {
                let prev = self.apply_put(&put.key, &put.value, put.lease, revision, events);
                response_op::Response::ResponsePut(PutResponse {
                    header: None,
                    prev_kv: prev.filter(|_| put.prev_kv),
                })
            }
            Some(request_op::Request::RequestDeleteRange(del)) => {
                let removed = self.apply_delete(&del.key, &del.range_end, revision, events);
                response_op::Response::ResponseDeleteRange(DeleteRangeResponse {
                    header: None,
                    deleted: removed.len() as i64,
                    prev_kvs: if del.prev_kv { removed } else { Vec::new() },
                })
            }
            Some(request_op::Request::RequestTxn(txn)) => {
                response_op::Response::ResponseTxn(self.apply_txn(txn, revision, events)?)
            }
            None => {
                return Err(RpcStatus::new(GrpcCode::InvalidArgument, "empty request op").into())
            }
        };
        Ok(ResponseOp {
            response: Some(response),
        })
    }

    fn evaluate(&self, cmp: &proto::Compare) -> bool {
        let current = self.kv.get(&cmp.key);
        let ordering = match &cmp.target_union {
            Some(compare::TargetUnion::Value(v)) => match current {
                Some(kv) => kv.value.as_slice().cmp(v.as_slice()),
                None => return false,
            },
            Some(compare::TargetUnion::Version(v)) => current.map_or(0, |kv| kv.version).cmp(v),
            Some(compare::TargetUnion::CreateRevision(r)) => {
                current.map_or(0, |kv| kv.create_revision).cmp(r)
            }
            Some(compare::TargetUnion::ModRevision(r)) => {
                current.map_or(0, |kv| kv.mod_revision).cmp(r)
            }
            Some(compare::TargetUnion::Lease(l)) => current.map_or(0, |kv| kv.lease).cmp(l),
            None => return false,
        };
        use std::cmp::Ordering;
        match compare::CompareResult::try_from(cmp.result) {
            Ok(compare::CompareResult::Equal) => ordering == Ordering::Equal,
            Ok(compare::CompareResult::Greater) => ordering == Ordering::Greater,
            Ok(compare::CompareResult::Less) => ordering == Ordering::Less,
            Ok(compare::CompareResult::NotEqual) => ordering != Ordering::Equal,
            Err(_) => false,
        }
    }

    fn grant(&mut self, req: &LeaseGrantRequest) -> ClientResult<LeaseGrantResponse> {
        let id = if req.id != 0 {
            req.id
        } else {
            self.next_lease += 1;
            self.next_lease
        };
        if self.leases.contains_key(&id) {
            return Err(RpcStatus::new(GrpcCode::FailedPrecondition, "etcdserver: lease already exists").into());
        }
        self.leases.insert(
            id,
            MockLease {
                granted_ttl: req.ttl,
                keys: HashSet::new(),
            },
        );
        Ok(LeaseGrantResponse {
            header: Some(self.header()),
            id,
            ttl: req.ttl,
            error: String::new(),
        })
    }

    fn drop_lease(&mut self, lease_id: i64) {
        let Some(lease) = self.leases.remove(&lease_id) else {
            return;
        };
        let revision = self.revision + 1;
        let mut events = Vec::new();
        for key in lease.keys {
            self.apply_delete(&key, &[], revision, &mut events);
        }
        self.commit(revision, events);
    }
}

// ============================================================================
// Connector / channel
// ============================================================================

struct MockConnector {
    cluster: MockCluster,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: &str,
        security: &SecurityContext,
    ) -> ClientResult<Arc<dyn RpcChannel>> {
        let mut state = self.cluster.state.lock();
        if state.unreachable.contains(address) {
            return Err(ClientError::unreachable(address, "connection refused"));
        }
        state
            .connects
            .push((address.to_string(), security.profile.clone()));
        drop(state);
        Ok(Arc::new(MockChannel {
            address: address.to_string(),
            cluster: self.cluster.clone(),
        }))
    }
}

struct MockChannel {
    address: String,
    cluster: MockCluster,
}

#[async_trait]
impl RpcChannel for MockChannel {
    async fn unary(
        &self,
        path: &'static str,
        request: WireMessage,
        _timeout: Option<Duration>,
    ) -> ClientResult<UnaryReply> {
        let latency = self.cluster.state.lock().latency.get(&self.address).copied();
        match latency {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.cluster.handle_unary(&self.address, path, &request)
    }

    async fn open_stream(
        &self,
        path: &'static str,
        encoding: Option<&str>,
    ) -> ClientResult<RpcStream> {
        let declared = encoding.map(str::to_string);
        self.cluster.admit(&self.address, path, declared.clone())?;
        match path {
            proto::WATCH => Ok(self.cluster.open_watch(&self.address, declared)),
            proto::LEASE_KEEP_ALIVE => self.cluster.open_keep_alive(declared),
            other => Err(RpcStatus::new(
                GrpcCode::Unimplemented,
                format!("no stream method {}", other),
            )
            .into()),
        }
    }
}
