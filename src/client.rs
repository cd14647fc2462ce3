//! Caller-facing client.
//!
//! A [`Client`] owns one endpoint pool and everything built on it:
//!
//! ```text
//!   Client
//!     ├── UnaryExecutor ──┐
//!     ├── WatchManager ───┼──► PolicyEngine ──► EndpointPool ──► Connector
//!     ├── LeaseManager ───┘                          │
//!     └── SecurityManager (+ refresher task) ◄───────┘
//! ```
//!
//! Cloning a client is cheap; clones share the pool. [`Client::close`] cancels
//! every watch, lease keeper and background task, then tears down channels.

use crate::cluster::{Endpoint, EndpointPool};
use crate::cluster::pool::normalize_address;
use crate::core::config::{ClientConfig, EndpointProfileBinding};
use crate::core::error::{ClientError, ClientResult};
use crate::core::time::CallOptions;
use crate::kv::proto::Member;
use crate::kv::{
    DeleteOptions, DeleteRangeResponse, GetOptions, PendingTxn, PutOptions, PutResponse,
    RangePages, RangeResponse, Table, Tables, Txn, TxnOptions, TxnResponse, UnaryExecutor,
};
use crate::lease::{
    LeaseGrant, LeaseKeeper, LeaseManager, LeaseRenewal, LeaseStatus, LeaseTimeToLive,
};
use crate::net::compression::CodecRegistry;
use crate::net::grpc::{GrpcConnector, GrpcConnectorConfig};
use crate::net::security::SecurityManager;
use crate::net::tls::SecurityProfile;
use crate::net::transport::Connector;
use crate::watch::{WatchConfig, WatchManager, WatchOptions, WatchStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builder for [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    codecs: Option<CodecRegistry>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("custom_connector", &self.connector.is_some())
            .field("codecs", &self.codecs)
            .finish()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Static endpoint list.
    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.endpoints = endpoints.into_iter().map(Into::into).collect();
        self.config.target = None;
        self
    }

    /// Target string (`ip:///`, `http://`, `https://` or a bare list).
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.config.target = Some(target.into());
        self.config.endpoints.clear();
        self
    }

    /// Add or replace a named security profile.
    pub fn security_profile(mut self, name: impl Into<String>, profile: SecurityProfile) -> Self {
        self.config.security.profiles.insert(name.into(), profile);
        self
    }

    /// Use a named security profile for one endpoint.
    pub fn endpoint_profile(mut self, address: impl Into<String>, profile: impl Into<String>) -> Self {
        self.config.endpoint_profiles.push(EndpointProfileBinding {
            address: address.into(),
            profile: profile.into(),
        });
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    /// Backoff curve: first delay, growth factor, cap.
    pub fn backoff(mut self, base: Duration, multiplier: f64, cap: Duration) -> Self {
        self.config.retry.base_delay_ms = base.as_millis() as u64;
        self.config.retry.multiplier = multiplier;
        self.config.retry.max_delay_ms = cap.as_millis() as u64;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    /// Default overall deadline for calls that set none.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.retry.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn redirect_cap(mut self, cap: u32) -> Self {
        self.config.retry.redirect_cap = cap;
        self
    }

    /// Circuit breaker threshold and open duration.
    pub fn circuit(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.config.circuit.failure_threshold = failure_threshold;
        self.config.circuit.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    /// Unreachable outcomes before an endpoint is Dead, and how long it stays out.
    pub fn dead_endpoint(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.config.pool.dead_threshold = threshold;
        self.config.pool.dead_cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Built-in codec preference, most preferred first.
    pub fn codec_order<I, S>(mut self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.compression.codecs = codecs.into_iter().map(Into::into).collect();
        self
    }

    /// Use a custom codec registry instead of the built-in codecs.
    pub fn codec_registry(mut self, registry: CodecRegistry) -> Self {
        self.codecs = Some(registry);
        self
    }

    pub fn keep_alive_fraction(mut self, fraction: f64) -> Self {
        self.config.lease.keep_alive_fraction = fraction;
        self
    }

    pub fn missed_keep_alive_limit(mut self, limit: u32) -> Self {
        self.config.lease.missed_keep_alive_limit = limit;
        self
    }

    pub fn watch_buffer(mut self, size: usize) -> Self {
        self.config.watch.buffer_size = size;
        self
    }

    /// Replace the gRPC transport.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Validate the configuration and assemble the client.
    ///
    /// When called inside a Tokio runtime and credential reload is enabled,
    /// the PEM refresher task is started.
    pub fn build(self) -> ClientResult<Client> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| ClientError::config(format!("{:#}", e)))?;
        let specs = config
            .endpoint_specs()
            .map_err(|e| ClientError::config(format!("{:#}", e)))?;

        let security = Arc::new(SecurityManager::new(
            config.security_config(),
            config.security.profiles.clone(),
        ));
        let codecs = Arc::new(match self.codecs {
            Some(registry) => registry,
            None => CodecRegistry::with_builtin(&config.compression.codecs)?,
        });
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(GrpcConnector::new(GrpcConnectorConfig {
                accept_encoding: codecs.accept_encoding_header(),
                ..config.connector_config()
            }))
        });
        let pool = Arc::new(EndpointPool::new(
            specs,
            config.pool_config(),
            connector,
            Arc::clone(&security),
        )?);

        let executor = UnaryExecutor::new(
            Arc::clone(&pool),
            Arc::clone(&codecs),
            config.retry_policy(),
            config.call_timeout(),
        );
        let watches = WatchManager::new(
            Arc::clone(&pool),
            Arc::clone(&codecs),
            WatchConfig {
                buffer_size: config.watch.buffer_size,
                policy: config.retry_policy(),
            },
        );
        let leases = LeaseManager::new(executor.clone(), config.lease_config());

        let shutdown = CancellationToken::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            security.spawn_refresher(shutdown.child_token());
        }

        tracing::info!(endpoints = ?pool.addresses(), "client ready");
        Ok(Client {
            inner: Arc::new(ClientInner {
                pool,
                security,
                executor,
                watches,
                leases,
                shutdown,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

#[derive(Debug)]
struct ClientInner {
    pool: Arc<EndpointPool>,
    security: Arc<SecurityManager>,
    executor: UnaryExecutor,
    watches: WatchManager,
    leases: LeaseManager,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Client for a replicated key-value cluster.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Build a client from configuration.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        ClientBuilder::from_config(config.clone()).build()
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    // ========================================================================
    // Key-value
    // ========================================================================

    /// Read a key or range.
    pub async fn get(
        &self,
        key: impl AsRef<[u8]>,
        options: GetOptions,
    ) -> ClientResult<RangeResponse> {
        self.ensure_open()?;
        self.inner.executor.get(key.as_ref(), &options).await
    }

    /// Write a key. A lease given in `options` records the key as attached.
    pub async fn put(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        options: PutOptions,
    ) -> ClientResult<PutResponse> {
        self.ensure_open()?;
        let key = key.as_ref();
        let response = self.inner.executor.put(key, value.as_ref(), &options).await?;
        if options.lease() != 0 {
            self.inner.leases.attach_key(options.lease(), key);
        }
        Ok(response)
    }

    /// Delete a key or range.
    pub async fn delete(
        &self,
        key: impl AsRef<[u8]>,
        options: DeleteOptions,
    ) -> ClientResult<DeleteRangeResponse> {
        self.ensure_open()?;
        self.inner.executor.delete(key.as_ref(), &options).await
    }

    /// Commit a transaction.
    pub async fn txn(&self, txn: Txn, options: TxnOptions) -> ClientResult<TxnResponse> {
        self.ensure_open()?;
        self.inner.executor.txn(&txn, &options).await
    }

    /// Read a range page by page, pinned to the revision of the first page.
    pub fn iterate(&self, key: impl AsRef<[u8]>, options: GetOptions) -> ClientResult<RangePages> {
        self.ensure_open()?;
        self.inner.executor.iterate(key.as_ref(), &options)
    }

    /// Key-value operations confined to table `name`.
    pub fn table(&self, name: &str) -> ClientResult<Table> {
        self.ensure_open()?;
        Table::new(name, self.inner.executor.clone())
    }

    /// Create, drop and list tables.
    pub fn tables(&self) -> ClientResult<Tables> {
        self.ensure_open()?;
        Ok(Tables::new(self.inner.executor.clone()))
    }

    /// Start a transaction: `when(..).and_then(..).or_else(..).commit()`.
    pub fn transaction(&self) -> PendingTxn<'_> {
        PendingTxn::new(&self.inner.executor)
    }

    // ========================================================================
    // Watch
    // ========================================================================

    /// Subscribe to changes. The stream reconnects on its own until cancelled.
    pub fn watch(&self, key: impl Into<Vec<u8>>, options: WatchOptions) -> ClientResult<WatchStream> {
        self.ensure_open()?;
        self.inner.watches.watch(key, options)
    }

    // ========================================================================
    // Leases
    // ========================================================================

    /// Grant a lease of `ttl` seconds.
    pub async fn grant_lease(&self, ttl: i64, call: CallOptions) -> ClientResult<LeaseGrant> {
        self.ensure_open()?;
        self.inner.leases.grant(ttl, 0, &call).await
    }

    /// Grant a lease with a caller-chosen id.
    pub async fn grant_lease_with_id(
        &self,
        ttl: i64,
        id: i64,
        call: CallOptions,
    ) -> ClientResult<LeaseGrant> {
        self.ensure_open()?;
        self.inner.leases.grant(ttl, id, &call).await
    }

    /// Keep a lease alive in the background.
    pub fn keep_alive_lease(&self, lease_id: i64) -> ClientResult<LeaseKeeper> {
        self.ensure_open()?;
        self.inner.leases.keep_alive(lease_id)
    }

    /// Renew a lease once.
    pub async fn keep_alive_once(&self, lease_id: i64, call: CallOptions) -> ClientResult<LeaseRenewal> {
        self.ensure_open()?;
        self.inner.leases.keep_alive_once(lease_id, &call).await
    }

    /// Revoke a lease. Revoking an already revoked or unknown lease succeeds.
    pub async fn revoke_lease(&self, lease_id: i64, call: CallOptions) -> ClientResult<()> {
        self.ensure_open()?;
        self.inner.leases.revoke(lease_id, &call).await
    }

    /// Remaining TTL of a lease, optionally with its attached keys.
    pub async fn lease_time_to_live(
        &self,
        lease_id: i64,
        with_keys: bool,
        call: CallOptions,
    ) -> ClientResult<LeaseTimeToLive> {
        self.ensure_open()?;
        self.inner.leases.time_to_live(lease_id, with_keys, &call).await
    }

    /// Local status of a lease known to this client.
    pub fn lease_status(&self, lease_id: i64) -> Option<LeaseStatus> {
        self.inner.leases.status(lease_id)
    }

    /// Keys written with `lease_id` through this client.
    pub fn lease_keys(&self, lease_id: i64) -> Vec<Vec<u8>> {
        self.inner.leases.attached_keys(lease_id)
    }

    // ========================================================================
    // Cluster
    // ========================================================================

    /// Current cluster members.
    pub async fn member_list(&self, call: CallOptions) -> ClientResult<Vec<Member>> {
        self.ensure_open()?;
        Ok(self.inner.executor.member_list(&call).await?.members)
    }

    /// Add client URLs advertised by the cluster to the pool.
    ///
    /// Returns the addresses that were new. Existing endpoints keep their state.
    pub async fn sync_endpoints(&self, call: CallOptions) -> ClientResult<Vec<String>> {
        let members = self.member_list(call).await?;
        let mut added = Vec::new();
        for url in members.iter().flat_map(|m| m.client_urls.iter()) {
            let address = normalize_address(url);
            if address.is_empty() || self.inner.pool.get(&address).is_some() {
                continue;
            }
            self.inner.pool.add_endpoint(&address);
            added.push(address);
        }
        if !added.is_empty() {
            tracing::info!(added = ?added, "endpoints synced from member list");
        }
        Ok(added)
    }

    /// Snapshot of the endpoint pool.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.inner.pool.endpoints()
    }

    /// The endpoint pool.
    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.inner.pool
    }

    /// The security manager (profile rotation, credential refresh).
    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.inner.security
    }

    /// The lease manager.
    pub fn leases(&self) -> &LeaseManager {
        &self.inner.leases
    }

    /// Close the client. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.watches.close();
        self.inner.leases.close();
        self.inner.shutdown.cancel();
        self.inner.pool.close();
        tracing::info!("client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
