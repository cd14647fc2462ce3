//! Watch stream manager.
//!
//! Each subscription runs as its own task bound to a cancellation token:
//!
//! ```text
//!              ┌──────────── Connecting
//!              ▼                 │ created
//!   ┌──► open stream ──► send create(resume + 1) ──► Streaming ──► events ──► mpsc ──► WatchStream
//!   │                                                    │
//!   │                                          disconnect / redirect
//!   │                                                    ▼
//!   └─────────────────── PolicyEngine (unbounded) ◄── Reconnecting
//!
//!   cancel() / drop / client close ──► Closed
//! ```
//!
//! The resume token is advanced before an event is handed to the consumer, so
//! a reconnect never re-delivers an event the consumer already received. A
//! compaction past the resume token ends the subscription with
//! [`ClientError::Compacted`].

use super::state::{WatchEvent, WatchOptions, WatchState, WatchStatus};
use crate::cluster::{EndpointPool, Preference};
use crate::core::error::{ClientError, ClientResult, GrpcCode, RpcStatus};
use crate::core::time::Deadline;
use crate::kv::proto::{self, WatchResponse};
use crate::net::compression::CodecRegistry;
use crate::net::transport::WireMessage;
use crate::policy::{classify_stream, Attempt, CallSpec, ErrorClass, PolicyEngine, RetryPolicy};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Watch manager configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Default per-subscription event buffer.
    pub buffer_size: usize,
    /// Reconnect curve; the attempt limit is ignored.
    pub policy: RetryPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            policy: RetryPolicy::default(),
        }
    }
}

/// Owns every watch subscription of one client.
#[derive(Debug)]
pub struct WatchManager {
    engine: PolicyEngine,
    codecs: Arc<CodecRegistry>,
    config: WatchConfig,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl WatchManager {
    pub fn new(pool: Arc<EndpointPool>, codecs: Arc<CodecRegistry>, config: WatchConfig) -> Self {
        Self {
            engine: PolicyEngine::new(pool),
            codecs,
            config,
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscriptions whose task is still running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Subscribe to changes of `key` (or a range, per `options`).
    pub fn watch(&self, key: impl Into<Vec<u8>>, options: WatchOptions) -> ClientResult<WatchStream> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let key = key.into();
        if key.is_empty() {
            return Err(ClientError::invalid_request("watch key must not be empty"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = WatchState::new(key, &options);
        let buffer = options.buffer_size().unwrap_or(self.config.buffer_size);
        let (events_tx, events_rx) = mpsc::channel(buffer);
        let (status_tx, status_rx) = watch::channel(WatchStatus::Connecting);
        let cancel = self.shutdown.child_token();
        let subscription = Arc::new(Subscription {
            id,
            resume: AtomicI64::new(state.last_revision),
            state: Mutex::new(state),
            status: status_tx,
        });

        let task = SubscriptionTask {
            subscription: Arc::clone(&subscription),
            engine: self.engine.clone(),
            codecs: Arc::clone(&self.codecs),
            policy: self.config.policy.unbounded(),
            events: events_tx,
            cancel: cancel.clone(),
        };
        let active = Arc::clone(&self.active);
        active.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            task.run().await;
            active.fetch_sub(1, Ordering::AcqRel);
        });

        tracing::debug!(watch_id = id, "watch subscribed");
        Ok(WatchStream {
            subscription,
            events: events_rx,
            status: status_rx,
            cancel,
        })
    }

    /// Cancel every subscription. New subscriptions are refused afterwards.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug)]
struct Subscription {
    id: u64,
    state: Mutex<WatchState>,
    /// Mirror of `state.last_revision` readable without the lock.
    resume: AtomicI64,
    status: watch::Sender<WatchStatus>,
}

impl Subscription {
    fn set_status(&self, status: WatchStatus) {
        self.status.send_if_modified(|current| {
            if *current == status || *current == WatchStatus::Closed {
                return false;
            }
            *current = status;
            true
        });
    }

    fn sync_resume(&self, state: &WatchState) {
        self.resume.store(state.last_revision, Ordering::Release);
    }
}

/// Why a healthy session ended.
enum SessionEnd {
    /// The stream dropped after being established. Reconnects right away unless
    /// the session delivered nothing.
    Disconnected { delivered: bool },
    /// Nobody is listening any more.
    ConsumerGone,
}

struct SubscriptionTask {
    subscription: Arc<Subscription>,
    engine: PolicyEngine,
    codecs: Arc<CodecRegistry>,
    policy: RetryPolicy,
    events: mpsc::Sender<ClientResult<WatchEvent>>,
    cancel: CancellationToken,
}

impl SubscriptionTask {
    async fn run(self) {
        let id = self.subscription.id;
        let mut idle_drops = 0u32;
        loop {
            let spec = CallSpec {
                operation: "watch",
                preference: Preference::AnyHealthy,
                policy: &self.policy,
                classify: classify_stream,
                deadline: Deadline::never(),
                cancel: self.cancel.clone(),
            };
            let result = self
                .engine
                .execute(spec, |attempt| self.session(attempt))
                .await;
            match result {
                Ok(SessionEnd::Disconnected { delivered }) => {
                    self.subscription.set_status(WatchStatus::Reconnecting);
                    tracing::info!(
                        watch_id = id,
                        resume_revision = self.subscription.resume.load(Ordering::Acquire),
                        "watch stream lost, reconnecting"
                    );
                    if delivered {
                        idle_drops = 0;
                        continue;
                    }
                    idle_drops = idle_drops.saturating_add(1);
                    let delay = self.policy.backoff.delay(idle_drops);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(SessionEnd::ConsumerGone) | Err(ClientError::Cancelled) => break,
                Err(err) => {
                    tracing::warn!(watch_id = id, error = %err, "watch failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = self.events.send(Err(err)) => {}
                    }
                    break;
                }
            }
        }
        self.subscription.set_status(WatchStatus::Closed);
        tracing::debug!(watch_id = id, "watch closed");
    }

    /// One stream lifetime against one endpoint.
    ///
    /// Failing before the server confirmed the watch is an error (the engine
    /// backs off); losing an established stream is a normal end.
    async fn session(&self, attempt: Attempt) -> ClientResult<SessionEnd> {
        let sub = &self.subscription;
        if attempt.number > 1 || *sub.status.borrow() != WatchStatus::Connecting {
            sub.set_status(WatchStatus::Reconnecting);
        }

        let codec = attempt.channel.negotiation().selected().map(str::to_string);
        let mut stream = attempt
            .channel
            .channel()
            .open_stream(proto::WATCH, codec.as_deref())
            .await?;
        let create = sub.state.lock().create_request();
        let wire = WireMessage::encode(&create, codec.as_deref(), &self.codecs)?;
        stream
            .outbound
            .send(wire)
            .await
            .map_err(|_| ClientError::transient("watch stream closed before create"))?;

        let mut established = false;
        let mut delivered = false;
        while let Some(item) = stream.inbound.next().await {
            let response: WatchResponse = match item.and_then(|w| w.decode(&self.codecs)) {
                Ok(response) => response,
                Err(err) if established && classify_stream(&err) == ErrorClass::Retryable => {
                    tracing::debug!(watch_id = sub.id, error = %err, "watch stream error");
                    return Ok(SessionEnd::Disconnected { delivered });
                }
                Err(err) => return Err(err),
            };
            let header_revision = response.header.as_ref().map_or(0, |h| h.revision);

            if response.compact_revision > 0 {
                let resume_revision = sub.state.lock().next_start_revision();
                return Err(ClientError::Compacted {
                    compact_revision: response.compact_revision,
                    resume_revision,
                });
            }
            if response.canceled {
                let reason = if response.cancel_reason.is_empty() {
                    "watch canceled by server".to_string()
                } else {
                    response.cancel_reason
                };
                return Err(RpcStatus::new(GrpcCode::FailedPrecondition, reason).into());
            }
            if response.created {
                established = true;
                let mut state = sub.state.lock();
                state.on_created(header_revision);
                sub.sync_resume(&state);
                drop(state);
                sub.set_status(WatchStatus::Streaming);
                tracing::debug!(watch_id = sub.id, endpoint = %attempt.endpoint.address(), "watch established");
                continue;
            }
            if response.events.is_empty() {
                let mut state = sub.state.lock();
                state.on_progress(header_revision);
                sub.sync_resume(&state);
                continue;
            }

            let batch = {
                let mut state = sub.state.lock();
                let batch = state.accept_batch(response.events);
                sub.sync_resume(&state);
                batch
            };
            for event in batch {
                if self.events.send(Ok(event)).await.is_err() {
                    return Ok(SessionEnd::ConsumerGone);
                }
                delivered = true;
            }
        }

        if established {
            Ok(SessionEnd::Disconnected { delivered })
        } else {
            Err(ClientError::transient("watch stream ended before creation"))
        }
    }
}

/// Consumer side of a watch subscription.
///
/// Yields events in revision order. A terminal error (compaction, server-side
/// rejection) is yielded once, after which the stream ends. Dropping the stream
/// cancels the subscription.
#[derive(Debug)]
pub struct WatchStream {
    subscription: Arc<Subscription>,
    events: mpsc::Receiver<ClientResult<WatchEvent>>,
    status: watch::Receiver<WatchStatus>,
    cancel: CancellationToken,
}

impl WatchStream {
    pub fn id(&self) -> u64 {
        self.subscription.id
    }

    /// Current lifecycle state.
    pub fn status(&self) -> WatchStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change.
    pub fn status_changes(&self) -> watch::Receiver<WatchStatus> {
        self.status.clone()
    }

    /// Resume token: revision of the last event delivered (or confirmed by the
    /// server). 0 before the watch was first established.
    pub fn resume_revision(&self) -> i64 {
        self.subscription.resume.load(Ordering::Acquire)
    }

    /// Stop the subscription. Buffered events remain readable.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for WatchStream {
    type Item = ClientResult<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
