//! Endpoint pool: selection, health accounting and channel ownership.
//!
//! # Selection order
//!
//! ```text
//!   PreferLeader ──► flagged leader (unless Dead)
//!        │
//!        ▼
//!   round-robin over Healthy ──► round-robin over Suspect ──► Dead past cooldown (one trial)
//!                                                                   │
//!                                                                   ▼
//!                                                        NoHealthyEndpoint
//! ```
//!
//! Every candidate must also pass its circuit breaker. The pool is owned by one
//! client; there is no process-wide channel cache.

use super::endpoint::{Endpoint, HealthState};
use crate::core::error::{ClientError, ClientResult, Outcome};
use crate::net::security::{SecurityManager, DEFAULT_PROFILE};
use crate::net::transport::{ChannelHandle, Connector};
use crate::policy::circuit::CircuitConfig;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Which endpoint a call would like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    /// Any usable endpoint (serializable reads).
    AnyHealthy,
    /// The leader when known (writes, linearizable reads).
    PreferLeader,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Consecutive Unreachable outcomes that mark an endpoint Dead.
    pub dead_threshold: u32,
    /// How long a Dead endpoint is excluded before it may be retried.
    pub dead_cooldown: Duration,
    /// Per-endpoint circuit breaker settings.
    pub circuit: CircuitConfig,
    /// Security profile for endpoints learned at runtime.
    pub default_profile: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dead_threshold: 3,
            dead_cooldown: Duration::from_secs(5),
            circuit: CircuitConfig::default(),
            default_profile: DEFAULT_PROFILE.to_string(),
        }
    }
}

/// Address plus the security profile it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub address: String,
    pub profile: String,
}

impl EndpointSpec {
    /// Endpoint bound to the default profile.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            profile: DEFAULT_PROFILE.to_string(),
        }
    }

    /// Endpoint bound to a named profile.
    pub fn with_profile(address: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            profile: profile.into(),
        }
    }
}

/// The set of known cluster members.
pub struct EndpointPool {
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    config: PoolConfig,
    cursor: AtomicUsize,
    connector: Arc<dyn Connector>,
    security: Arc<SecurityManager>,
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPool")
            .field("endpoints", &self.addresses())
            .field("config", &self.config)
            .finish()
    }
}

impl EndpointPool {
    /// Create a pool. At least one endpoint is required.
    pub fn new(
        specs: Vec<EndpointSpec>,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        security: Arc<SecurityManager>,
    ) -> ClientResult<Self> {
        if specs.is_empty() {
            return Err(ClientError::config("at least one endpoint is required"));
        }
        let pool = Self {
            endpoints: RwLock::new(Vec::new()),
            config,
            cursor: AtomicUsize::new(0),
            connector,
            security,
        };
        pool.set_endpoints(specs);
        Ok(pool)
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Security manager shared with the transport.
    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    /// Snapshot of all endpoints.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().clone()
    }

    /// Addresses of all endpoints, in insertion order.
    pub fn addresses(&self) -> Vec<String> {
        self.endpoints
            .read()
            .iter()
            .map(|e| e.address().to_string())
            .collect()
    }

    /// Look up an endpoint by address.
    pub fn get(&self, address: &str) -> Option<Arc<Endpoint>> {
        let address = normalize_address(address);
        self.endpoints
            .read()
            .iter()
            .find(|e| e.address() == address)
            .cloned()
    }

    /// The endpoint currently flagged leader.
    pub fn leader(&self) -> Option<Arc<Endpoint>> {
        self.endpoints.read().iter().find(|e| e.is_leader()).cloned()
    }

    /// Replace the endpoint set.
    ///
    /// Endpoints present before and after keep their health and channel.
    pub fn set_endpoints(&self, specs: Vec<EndpointSpec>) {
        let mut endpoints = self.endpoints.write();
        let mut next = Vec::with_capacity(specs.len());
        for spec in specs {
            let address = normalize_address(&spec.address);
            if next.iter().any(|e: &Arc<Endpoint>| e.address() == address) {
                continue;
            }
            let existing = endpoints
                .iter()
                .find(|e| e.address() == address && e.profile() == spec.profile)
                .cloned();
            next.push(existing.unwrap_or_else(|| {
                Arc::new(Endpoint::new(address, spec.profile, self.config.circuit))
            }));
        }
        for removed in endpoints
            .iter()
            .filter(|e| !next.iter().any(|n| Arc::ptr_eq(n, e)))
        {
            removed.clear_channel();
            tracing::info!(endpoint = %removed.address(), "endpoint removed");
        }
        *endpoints = next;
    }

    /// Add an endpoint learned at runtime, or return the existing one.
    pub fn add_endpoint(&self, address: &str) -> Arc<Endpoint> {
        let address = normalize_address(address);
        let mut endpoints = self.endpoints.write();
        if let Some(existing) = endpoints.iter().find(|e| e.address() == address) {
            return Arc::clone(existing);
        }
        let endpoint = Arc::new(Endpoint::new(
            address,
            self.config.default_profile.clone(),
            self.config.circuit,
        ));
        tracing::info!(endpoint = %endpoint.address(), "endpoint discovered");
        endpoints.push(Arc::clone(&endpoint));
        endpoint
    }

    /// Pick an endpoint for the next attempt.
    pub fn select(&self, preference: Preference) -> ClientResult<Arc<Endpoint>> {
        let endpoints = self.endpoints();
        let mut denied: Option<String> = None;

        if preference == Preference::PreferLeader {
            if let Some(leader) = endpoints
                .iter()
                .find(|e| e.is_leader() && e.state() != HealthState::Dead)
            {
                if leader.circuit().try_acquire() {
                    return Ok(Arc::clone(leader));
                }
                denied = Some(leader.address().to_string());
            }
        }

        for tier in [HealthState::Healthy, HealthState::Suspect] {
            let candidates: Vec<&Arc<Endpoint>> =
                endpoints.iter().filter(|e| e.state() == tier).collect();
            if candidates.is_empty() {
                continue;
            }
            let start = self.cursor.fetch_add(1, Ordering::Relaxed);
            for offset in 0..candidates.len() {
                let candidate = candidates[(start + offset) % candidates.len()];
                if candidate.circuit().try_acquire() {
                    return Ok(Arc::clone(candidate));
                }
                denied.get_or_insert_with(|| candidate.address().to_string());
            }
        }

        for endpoint in endpoints.iter().filter(|e| e.state() == HealthState::Dead) {
            if endpoint.circuit().would_admit()
                && endpoint.claim_retry(self.config.dead_cooldown)
                && endpoint.circuit().try_acquire()
            {
                tracing::debug!(endpoint = %endpoint.address(), "retrying dead endpoint");
                return Ok(Arc::clone(endpoint));
            }
        }

        match denied {
            Some(endpoint) => Err(ClientError::CircuitOpen { endpoint }),
            None => Err(ClientError::NoHealthyEndpoint),
        }
    }

    /// Record the outcome of an attempt against `endpoint`.
    pub fn report(&self, endpoint: &Endpoint, outcome: Outcome) {
        if let Some(state) = endpoint.apply(&outcome, self.config.dead_threshold) {
            match state {
                HealthState::Healthy => {
                    tracing::info!(endpoint = %endpoint.address(), "endpoint healthy")
                }
                HealthState::Suspect => {
                    tracing::warn!(endpoint = %endpoint.address(), "endpoint suspect")
                }
                HealthState::Dead => tracing::warn!(
                    endpoint = %endpoint.address(),
                    cooldown_ms = self.config.dead_cooldown.as_millis() as u64,
                    "endpoint dead"
                ),
            }
        }
        if let Outcome::NotLeader {
            leader_hint: Some(hint),
        } = &outcome
        {
            self.promote_leader(hint);
        }
    }

    /// Flag `address` as leader, clearing the flag everywhere else.
    pub fn promote_leader(&self, address: &str) {
        let leader = self.add_endpoint(address);
        for endpoint in self.endpoints.read().iter() {
            endpoint.set_leader(Arc::ptr_eq(endpoint, &leader));
        }
        tracing::info!(leader = %leader.address(), "leader updated");
    }

    /// Channel for `endpoint`, connecting if needed.
    ///
    /// Channels built under an older security generation are replaced.
    pub async fn channel(&self, endpoint: &Endpoint) -> ClientResult<ChannelHandle> {
        let generation = self.security.generation();
        if let Some(handle) = endpoint.current_channel(generation) {
            return Ok(handle);
        }

        let _guard = endpoint.connect_lock().lock().await;
        if let Some(handle) = endpoint.current_channel(generation) {
            return Ok(handle);
        }

        let context = self.security.context(endpoint.profile())?;
        let channel = self.connector.connect(endpoint.address(), &context).await?;
        let handle = ChannelHandle::new(channel, generation);
        endpoint.install_channel(handle.clone());
        tracing::debug!(endpoint = %endpoint.address(), generation, "channel installed");
        Ok(handle)
    }

    /// Tear down every channel.
    pub fn close(&self) {
        for endpoint in self.endpoints.read().iter() {
            endpoint.clear_channel();
        }
    }
}

/// Strip any URL scheme and trailing slash from an advertised address.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    without_scheme.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tls::SecurityContext;
    use crate::net::transport::RpcChannel;
    use async_trait::async_trait;

    struct NeverConnect;

    #[async_trait]
    impl Connector for NeverConnect {
        async fn connect(
            &self,
            address: &str,
            _security: &SecurityContext,
        ) -> ClientResult<Arc<dyn RpcChannel>> {
            Err(ClientError::unreachable(address, "refused"))
        }
    }

    fn pool(addresses: &[&str]) -> EndpointPool {
        EndpointPool::new(
            addresses.iter().map(|a| EndpointSpec::new(*a)).collect(),
            PoolConfig::default(),
            Arc::new(NeverConnect),
            Arc::new(SecurityManager::plaintext()),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        let result = EndpointPool::new(
            Vec::new(),
            PoolConfig::default(),
            Arc::new(NeverConnect),
            Arc::new(SecurityManager::plaintext()),
        );
        assert!(matches!(result, Err(ClientError::Config { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_over_healthy() {
        let pool = pool(&["a:1", "b:1", "c:1"]);
        let mut seen: Vec<String> = (0..3)
            .map(|_| pool.select(Preference::AnyHealthy).unwrap().address().to_string())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["a:1", "b:1", "c:1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_preferred_only_when_asked() {
        let pool = pool(&["a:1", "b:1", "c:1"]);
        pool.promote_leader("b:1");
        for _ in 0..5 {
            assert_eq!(pool.select(Preference::PreferLeader).unwrap().address(), "b:1");
        }
        let any: Vec<String> = (0..3)
            .map(|_| pool.select(Preference::AnyHealthy).unwrap().address().to_string())
            .collect();
        assert!(any.iter().any(|a| a != "b:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspect_only_when_no_healthy() {
        let pool = pool(&["a:1", "b:1"]);
        let a = pool.get("a:1").unwrap();
        pool.report(&a, Outcome::Unreachable);
        for _ in 0..4 {
            assert_eq!(pool.select(Preference::AnyHealthy).unwrap().address(), "b:1");
        }
        let b = pool.get("b:1").unwrap();
        pool.report(&b, Outcome::Unreachable);
        assert!(pool.select(Preference::AnyHealthy).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_dead_is_no_healthy_endpoint() {
        let pool = pool(&["a:1"]);
        let a = pool.get("a:1").unwrap();
        for _ in 0..3 {
            pool.report(&a, Outcome::Unreachable);
        }
        assert_eq!(a.state(), HealthState::Dead);
        assert!(matches!(
            pool.select(Preference::PreferLeader),
            Err(ClientError::NoHealthyEndpoint)
        ));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(pool.select(Preference::AnyHealthy).unwrap().address(), "a:1");
        assert!(pool.select(Preference::AnyHealthy).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_leader_hint_moves_flag() {
        let pool = pool(&["a:1", "b:1", "c:1"]);
        pool.promote_leader("a:1");
        let a = pool.get("a:1").unwrap();
        pool.report(
            &a,
            Outcome::NotLeader {
                leader_hint: Some("b:1".to_string()),
            },
        );
        assert_eq!(pool.leader().unwrap().address(), "b:1");
        assert!(!a.is_leader());
        assert_eq!(a.state(), HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_hint_is_added() {
        let pool = pool(&["a:1"]);
        let a = pool.get("a:1").unwrap();
        pool.report(
            &a,
            Outcome::NotLeader {
                leader_hint: Some("http://d:1/".to_string()),
            },
        );
        assert_eq!(pool.addresses(), vec!["a:1", "d:1"]);
        assert_eq!(pool.leader().unwrap().address(), "d:1");
    }

    #[test]
    fn test_set_endpoints_keeps_existing_state() {
        let pool = pool(&["a:1", "b:1"]);
        let a = pool.get("a:1").unwrap();
        pool.set_endpoints(vec![EndpointSpec::new("a:1"), EndpointSpec::new("c:1")]);
        assert!(Arc::ptr_eq(&a, &pool.get("a:1").unwrap()));
        assert!(pool.get("b:1").is_none());
        assert_eq!(pool.addresses(), vec!["a:1", "c:1"]);
    }

    #[tokio::test]
    async fn test_connect_failure_is_unreachable() {
        let pool = pool(&["a:1"]);
        let a = pool.get("a:1").unwrap();
        let err = pool.channel(&a).await.unwrap_err();
        assert!(matches!(err, ClientError::Unreachable { .. }));
        assert!(!a.has_channel());
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("https://kv-1:2379/"), "kv-1:2379");
        assert_eq!(normalize_address(" kv-2:2379 "), "kv-2:2379");
    }
}
