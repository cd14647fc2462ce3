//! Lease manager.
//!
//! ```text
//!   grant ──► Granted ──► keep_alive() ──► Alive ◄─────────┐
//!                                            │             │ renewed (TTL > 0)
//!                                            ▼             │
//!                          sleep until deadline - TTL * fraction
//!                                            │
//!                               keep-alive via PolicyEngine
//!                                 │          │          │
//!                        TTL <= 0 │   failed │          └───┘
//!                                 ▼          ▼
//!                             Expired ◄── missed >= limit
//!
//!   revoke ──► Revoked (also when the server no longer knows the lease)
//! ```
//!
//! Every keep-alive for one lease, from the heartbeat task or from
//! [`LeaseManager::keep_alive_once`], goes through the same per-lease guard, so
//! at most one is in flight at a time. Terminal states are reported on the
//! [`LeaseKeeper`] stream as [`ClientError::LeaseExpired`] or
//! [`ClientError::LeaseRevoked`].
//!
//! A lease that ended is dropped from the table; only its final status is
//! remembered, for the most recent [`RETIRED_LEASES`] ids.

use super::state::{LeaseRecord, LeaseStatus, RetiredLeases};
use crate::cluster::Preference;
use crate::core::error::{ClientError, ClientResult, GrpcCode};
use crate::core::time::{CallOptions, Deadline};
use crate::kv::executor::{CallKind, UnaryExecutor};
use crate::kv::proto::{
    self, LeaseGrantRequest, LeaseGrantResponse, LeaseKeepAliveRequest, LeaseKeepAliveResponse,
    LeaseRevokeRequest, LeaseRevokeResponse, LeaseTimeToLiveRequest, LeaseTimeToLiveResponse,
};
use crate::net::compression::CodecRegistry;
use crate::net::transport::WireMessage;
use crate::policy::{classify_idempotent, Attempt, CallSpec};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Renewal notifications buffered per keeper. While the buffer is full new
/// renewals are dropped; the terminal error waits for room.
const KEEPER_BUFFER: usize = 16;

/// Ended leases whose final status is still reported.
pub const RETIRED_LEASES: usize = 1024;

/// Lease manager configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeaseConfig {
    /// Fraction of the TTL left on the deadline when a keep-alive is sent.
    pub keep_alive_fraction: f64,
    /// Consecutive failed keep-alives before the lease is presumed expired.
    pub missed_limit: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            keep_alive_fraction: 0.5,
            missed_limit: 2,
        }
    }
}

/// Result of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: i64,
    /// Granted TTL in seconds.
    pub ttl: i64,
}

/// Result of a successful keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRenewal {
    pub id: i64,
    /// Remaining TTL in seconds.
    pub ttl: i64,
}

/// Result of a time-to-live query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTimeToLive {
    pub id: i64,
    /// Remaining TTL in seconds.
    pub ttl: i64,
    /// TTL the lease was granted with.
    pub granted_ttl: i64,
    /// Keys attached on the server (only when requested).
    pub keys: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct LeaseEntry {
    record: Mutex<LeaseRecord>,
    in_flight: tokio::sync::Mutex<()>,
    keeper: Mutex<Option<CancellationToken>>,
    /// Granted by another client.
    adopted: bool,
}

impl LeaseEntry {
    fn new(record: LeaseRecord) -> Self {
        Self {
            adopted: !record.ttl_known,
            record: Mutex::new(record),
            in_flight: tokio::sync::Mutex::new(()),
            keeper: Mutex::new(None),
        }
    }

    fn status(&self) -> LeaseStatus {
        self.record.lock().status
    }

    fn stop_keeper(&self) {
        if let Some(token) = self.keeper.lock().take() {
            token.cancel();
        }
    }

    fn has_keeper(&self) -> bool {
        self.keeper.lock().as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

/// Live leases plus the final status of recently ended ones.
#[derive(Debug)]
struct LeaseTable {
    live: HashMap<i64, Arc<LeaseEntry>>,
    retired: RetiredLeases,
}

impl LeaseTable {
    fn status(&self, lease_id: i64) -> Option<LeaseStatus> {
        match self.live.get(&lease_id) {
            Some(entry) => Some(entry.status()),
            None => self.retired.get(lease_id),
        }
    }

    /// Move `lease_id` to the retired set once it reached a terminal status.
    fn retire(&mut self, lease_id: i64) {
        let Some(status) = self.live.get(&lease_id).map(|e| e.status()) else {
            return;
        };
        if status.is_terminal() {
            self.live.remove(&lease_id);
            self.retired.insert(lease_id, status);
        }
    }

    /// A keeper on `entry` finished.
    fn keeper_finished(&mut self, lease_id: i64, entry: &Arc<LeaseEntry>) {
        let current = self.live.get(&lease_id).is_some_and(|e| Arc::ptr_eq(e, entry));
        if !current {
            return;
        }
        if entry.status().is_terminal() {
            self.retire(lease_id);
        } else if entry.adopted && !entry.has_keeper() {
            self.live.remove(&lease_id);
        }
    }
}

/// Owns every lease of one client.
#[derive(Debug)]
pub struct LeaseManager {
    executor: UnaryExecutor,
    config: LeaseConfig,
    table: Arc<Mutex<LeaseTable>>,
    shutdown: CancellationToken,
}

impl LeaseManager {
    pub fn new(executor: UnaryExecutor, config: LeaseConfig) -> Self {
        Self {
            executor,
            config,
            table: Arc::new(Mutex::new(LeaseTable {
                live: HashMap::new(),
                retired: RetiredLeases::new(RETIRED_LEASES),
            })),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Grant a lease with `ttl` seconds. `id` 0 lets the server pick.
    pub async fn grant(&self, ttl: i64, id: i64, call: &CallOptions) -> ClientResult<LeaseGrant> {
        if ttl <= 0 {
            return Err(ClientError::invalid_request("lease ttl must be positive"));
        }
        let request = LeaseGrantRequest { ttl, id };
        let response: LeaseGrantResponse = self
            .executor
            .unary(
                "lease_grant",
                proto::LEASE_GRANT,
                &request,
                CallKind::Write,
                call,
            )
            .await?;
        if !response.error.is_empty() {
            return Err(ClientError::Rpc {
                code: GrpcCode::FailedPrecondition,
                message: response.error,
            });
        }

        let record = LeaseRecord::new(response.id, response.ttl, Instant::now());
        let mut table = self.table.lock();
        table.retired.remove(response.id);
        table
            .live
            .insert(response.id, Arc::new(LeaseEntry::new(record)));
        drop(table);
        tracing::info!(lease_id = response.id, ttl = response.ttl, "lease granted");
        Ok(LeaseGrant {
            id: response.id,
            ttl: response.ttl,
        })
    }

    /// Revoke a lease. Revoking a lease the server no longer knows succeeds.
    pub async fn revoke(&self, lease_id: i64, call: &CallOptions) -> ClientResult<()> {
        if self.status(lease_id) == Some(LeaseStatus::Revoked) {
            return Ok(());
        }
        let request = LeaseRevokeRequest { id: lease_id };
        let result: ClientResult<LeaseRevokeResponse> = self
            .executor
            .unary(
                "lease_revoke",
                proto::LEASE_REVOKE,
                &request,
                CallKind::IdempotentWrite,
                call,
            )
            .await;
        match result {
            Ok(_) => {}
            Err(err) if err.root().is_not_found() => {
                tracing::debug!(lease_id, "lease already gone on revoke");
            }
            Err(err) => return Err(err),
        }

        if let Some(entry) = self.entry(lease_id) {
            entry.record.lock().revoke();
            entry.stop_keeper();
        }
        let mut table = self.table.lock();
        table.retire(lease_id);
        table.retired.insert(lease_id, LeaseStatus::Revoked);
        drop(table);
        tracing::info!(lease_id, "lease revoked");
        Ok(())
    }

    /// One keep-alive, outside any heartbeat schedule.
    pub async fn keep_alive_once(
        &self,
        lease_id: i64,
        call: &CallOptions,
    ) -> ClientResult<LeaseRenewal> {
        let entry = self.entry_or_adopt(lease_id)?;
        let deadline = call.deadline(self.executor.default_timeout());
        let result = keep_alive(&self.executor, &entry, lease_id, deadline, call.token()).await;
        if matches!(result, Err(ClientError::LeaseExpired { .. })) {
            self.table.lock().retire(lease_id);
        }
        result
    }

    /// Query the remaining TTL.
    pub async fn time_to_live(
        &self,
        lease_id: i64,
        with_keys: bool,
        call: &CallOptions,
    ) -> ClientResult<LeaseTimeToLive> {
        time_to_live(&self.executor, lease_id, with_keys, call).await
    }

    /// Start the background heartbeat for `lease_id`.
    ///
    /// Only one keeper may run per lease; dropping the returned handle stops it
    /// without revoking the lease.
    pub fn keep_alive(&self, lease_id: i64) -> ClientResult<LeaseKeeper> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let entry = self.entry_or_adopt(lease_id)?;
        match entry.status() {
            LeaseStatus::Expired => return Err(ClientError::LeaseExpired { lease_id }),
            LeaseStatus::Revoked => return Err(ClientError::LeaseRevoked { lease_id }),
            LeaseStatus::Granted | LeaseStatus::Alive => {}
        }

        let cancel = self.shutdown.child_token();
        {
            let mut keeper = entry.keeper.lock();
            if keeper.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return Err(ClientError::invalid_request(format!(
                    "lease {} already has a keep-alive running",
                    lease_id
                )));
            }
            *keeper = Some(cancel.clone());
        }

        let (tx, rx) = mpsc::channel(KEEPER_BUFFER);
        let heartbeat = Heartbeat {
            executor: self.executor.clone(),
            table: Arc::clone(&self.table),
            entry: Arc::clone(&entry),
            lease_id,
            config: self.config,
            renewals: tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(heartbeat.run());
        tracing::debug!(lease_id, "lease keeper started");

        Ok(LeaseKeeper {
            lease_id,
            entry,
            renewals: rx,
            cancel,
        })
    }

    /// Record that `key` was written with `lease_id`.
    pub fn attach_key(&self, lease_id: i64, key: impl Into<Vec<u8>>) {
        if let Some(entry) = self.entry(lease_id) {
            entry.record.lock().attach_key(key.into());
        }
    }

    /// Keys written with `lease_id` through this client.
    pub fn attached_keys(&self, lease_id: i64) -> Vec<Vec<u8>> {
        self.entry(lease_id)
            .map(|e| e.record.lock().attached_keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Local status of `lease_id`, including recently ended leases.
    pub fn status(&self, lease_id: i64) -> Option<LeaseStatus> {
        self.table.lock().status(lease_id)
    }

    /// Number of leases still tracked (not yet revoked or expired).
    pub fn tracked(&self) -> usize {
        self.table.lock().live.len()
    }

    /// Snapshot of a lease record.
    pub fn record(&self, lease_id: i64) -> Option<LeaseRecord> {
        self.entry(lease_id).map(|e| e.record.lock().clone())
    }

    /// Stop every keeper. Leases are left to expire on the server.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn entry(&self, lease_id: i64) -> Option<Arc<LeaseEntry>> {
        self.table.lock().live.get(&lease_id).cloned()
    }

    /// Entry for `lease_id`, adopting a lease granted elsewhere. Ended leases
    /// are not adopted again.
    fn entry_or_adopt(&self, lease_id: i64) -> ClientResult<Arc<LeaseEntry>> {
        let mut table = self.table.lock();
        if let Some(entry) = table.live.get(&lease_id) {
            return Ok(Arc::clone(entry));
        }
        match table.retired.get(lease_id) {
            Some(LeaseStatus::Revoked) => return Err(ClientError::LeaseRevoked { lease_id }),
            Some(_) => return Err(ClientError::LeaseExpired { lease_id }),
            None => {}
        }
        let entry = Arc::new(LeaseEntry::new(LeaseRecord::adopted(lease_id, Instant::now())));
        table.live.insert(lease_id, Arc::clone(&entry));
        Ok(entry)
    }
}

async fn time_to_live(
    executor: &UnaryExecutor,
    lease_id: i64,
    with_keys: bool,
    call: &CallOptions,
) -> ClientResult<LeaseTimeToLive> {
    let request = LeaseTimeToLiveRequest {
        id: lease_id,
        keys: with_keys,
    };
    let response: LeaseTimeToLiveResponse = executor
        .unary(
            "lease_time_to_live",
            proto::LEASE_TIME_TO_LIVE,
            &request,
            CallKind::Read,
            call,
        )
        .await
        .map_err(|e| not_found_as_lease(e, lease_id))?;
    if response.ttl < 0 {
        return Err(ClientError::LeaseNotFound { lease_id });
    }
    Ok(LeaseTimeToLive {
        id: response.id,
        ttl: response.ttl,
        granted_ttl: response.granted_ttl,
        keys: response.keys,
    })
}

fn not_found_as_lease(err: ClientError, lease_id: i64) -> ClientError {
    if err.root().is_not_found() {
        ClientError::LeaseNotFound { lease_id }
    } else {
        err
    }
}

/// Send one keep-alive for `lease_id`, holding the lease's in-flight guard.
async fn keep_alive(
    executor: &UnaryExecutor,
    entry: &LeaseEntry,
    lease_id: i64,
    deadline: Deadline,
    cancel: CancellationToken,
) -> ClientResult<LeaseRenewal> {
    let _guard = entry.in_flight.lock().await;
    match entry.status() {
        LeaseStatus::Revoked => return Err(ClientError::LeaseRevoked { lease_id }),
        LeaseStatus::Expired => return Err(ClientError::LeaseExpired { lease_id }),
        LeaseStatus::Granted | LeaseStatus::Alive => {}
    }

    let spec = CallSpec {
        operation: "lease_keep_alive",
        preference: Preference::PreferLeader,
        policy: executor.policy(),
        classify: classify_idempotent,
        deadline,
        cancel,
    };
    let codecs = executor.codecs().as_ref();
    let response = executor
        .engine()
        .execute(spec, |attempt| keep_alive_attempt(codecs, attempt, lease_id))
        .await
        .map_err(|e| not_found_as_lease(e, lease_id))?;

    let mut record = entry.record.lock();
    if response.ttl <= 0 {
        record.expire();
        return Err(ClientError::LeaseExpired { lease_id });
    }
    record.on_keep_alive(response.ttl, Instant::now());
    Ok(LeaseRenewal {
        id: lease_id,
        ttl: response.ttl,
    })
}

async fn keep_alive_attempt(
    codecs: &CodecRegistry,
    attempt: Attempt,
    lease_id: i64,
) -> ClientResult<LeaseKeepAliveResponse> {
    let codec = attempt.channel.negotiation().selected().map(str::to_string);
    let mut stream = attempt
        .channel
        .channel()
        .open_stream(proto::LEASE_KEEP_ALIVE, codec.as_deref())
        .await?;
    let wire = WireMessage::encode(&LeaseKeepAliveRequest { id: lease_id }, codec.as_deref(), codecs)?;
    stream
        .outbound
        .send(wire)
        .await
        .map_err(|_| ClientError::transient("keep-alive stream closed before request"))?;
    match stream.inbound.next().await {
        Some(item) => item?.decode(codecs),
        None => Err(ClientError::transient(
            "keep-alive stream closed without response",
        )),
    }
}

struct Heartbeat {
    executor: UnaryExecutor,
    table: Arc<Mutex<LeaseTable>>,
    entry: Arc<LeaseEntry>,
    lease_id: i64,
    config: LeaseConfig,
    renewals: mpsc::Sender<ClientResult<LeaseRenewal>>,
    cancel: CancellationToken,
}

impl Heartbeat {
    async fn run(self) {
        let lease_id = self.lease_id;
        let terminal = loop {
            if !self.entry.record.lock().ttl_known {
                match self.learn_ttl().await {
                    Ok(()) => {}
                    Err(ClientError::Cancelled) => break None,
                    Err(ClientError::LeaseNotFound { .. }) => {
                        self.entry.record.lock().expire();
                        break Some(ClientError::LeaseExpired { lease_id });
                    }
                    Err(err) => {
                        let (expired, missed) = {
                            let mut record = self.entry.record.lock();
                            (record.on_missed(self.config.missed_limit), record.missed)
                        };
                        tracing::warn!(lease_id, error = %err, expired, "lease ttl query failed");
                        if expired {
                            break Some(ClientError::LeaseExpired { lease_id });
                        }
                        let delay = self.executor.policy().backoff.delay(missed);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break None,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                }
            }

            let (at, deadline) = {
                let record = self.entry.record.lock();
                let now = Instant::now();
                (
                    record.next_heartbeat(self.config.keep_alive_fraction, now),
                    record.deadline,
                )
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break None,
                _ = tokio::time::sleep_until(at) => {}
            }

            let now = Instant::now();
            if self.entry.record.lock().missed > 0 && now >= deadline {
                self.entry.record.lock().expire();
                break Some(ClientError::LeaseExpired { lease_id });
            }
            let remaining = deadline.saturating_duration_since(now);
            let budget = if remaining.is_zero() {
                self.executor.default_timeout()
            } else {
                remaining.min(self.executor.default_timeout())
            };
            let result = keep_alive(
                &self.executor,
                &self.entry,
                lease_id,
                Deadline::after(budget),
                self.cancel.clone(),
            )
            .await;

            match result {
                Ok(renewal) => {
                    tracing::debug!(lease_id, ttl = renewal.ttl, "lease renewed");
                    let _ = self.renewals.try_send(Ok(renewal));
                }
                Err(ClientError::Cancelled) => break None,
                Err(err @ ClientError::LeaseExpired { .. })
                | Err(err @ ClientError::LeaseRevoked { .. }) => break Some(err),
                Err(ClientError::LeaseNotFound { .. }) => {
                    self.entry.record.lock().expire();
                    break Some(ClientError::LeaseExpired { lease_id });
                }
                Err(err) => {
                    let expired = self.entry.record.lock().on_missed(self.config.missed_limit);
                    tracing::warn!(lease_id, error = %err, expired, "lease keep-alive missed");
                    if expired {
                        break Some(ClientError::LeaseExpired { lease_id });
                    }
                }
            }
        };

        let terminal = terminal.or_else(|| match self.entry.status() {
            LeaseStatus::Revoked => Some(ClientError::LeaseRevoked { lease_id }),
            _ => None,
        });
        self.table.lock().keeper_finished(lease_id, &self.entry);
        if let Some(err) = terminal {
            tracing::info!(lease_id, error = %err, "lease keeper finished");
            // Fails only once the keeper is dropped.
            let _ = self.renewals.send(Err(err)).await;
        }
    }

    /// Ask the server for the TTL of an adopted lease.
    async fn learn_ttl(&self) -> ClientResult<()> {
        let call = CallOptions::new().with_cancel(self.cancel.clone());
        let ttl = time_to_live(&self.executor, self.lease_id, false, &call).await?;
        self.entry
            .record
            .lock()
            .learn_ttl(ttl.granted_ttl, ttl.ttl, Instant::now());
        tracing::debug!(
            lease_id = self.lease_id,
            ttl = ttl.ttl,
            granted_ttl = ttl.granted_ttl,
            "adopted lease ttl learned"
        );
        Ok(())
    }
}

/// Handle to a running lease heartbeat.
///
/// Yields each renewal and, when the lease ends, one terminal error. Dropping
/// the keeper or calling [`LeaseKeeper::stop`] ends the heartbeat; the lease
/// itself stays granted until it expires or is revoked.
#[derive(Debug)]
pub struct LeaseKeeper {
    lease_id: i64,
    entry: Arc<LeaseEntry>,
    renewals: mpsc::Receiver<ClientResult<LeaseRenewal>>,
    cancel: CancellationToken,
}

impl LeaseKeeper {
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    /// Local lease status.
    pub fn status(&self) -> LeaseStatus {
        self.entry.status()
    }

    /// Estimated server-side expiry.
    pub fn deadline(&self) -> Instant {
        self.entry.record.lock().deadline
    }

    /// Stop the heartbeat.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Stream for LeaseKeeper {
    type Item = ClientResult<LeaseRenewal>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.renewals.poll_recv(cx)
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
