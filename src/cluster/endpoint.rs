//! A single cluster member as seen by the client.
//!
//! Health bookkeeping lives behind a narrow `parking_lot` lock that is held only for
//! the state transition itself. The channel slot is a read-mostly lock over an
//! immutable [`ChannelHandle`]; establishing a new channel is serialized per endpoint
//! by an async mutex so concurrent callers queue briefly instead of dialing twice.

use crate::core::error::Outcome;
use crate::net::transport::ChannelHandle;
use crate::policy::circuit::{CircuitBreaker, CircuitConfig};
use parking_lot::{Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Endpoint health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    /// Answered the most recent call.
    Healthy,
    /// Recently unreachable; used only when no Healthy endpoint exists.
    Suspect,
    /// Unreachable for the configured number of consecutive attempts.
    Dead,
}

/// Snapshot of an endpoint's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRecord {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub dead_since: Option<Instant>,
    pub is_leader: bool,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_success: None,
            dead_since: None,
            is_leader: false,
        }
    }
}

/// One cluster member.
#[derive(Debug)]
pub struct Endpoint {
    address: String,
    profile: String,
    health: Mutex<HealthRecord>,
    circuit: CircuitBreaker,
    channel: RwLock<Option<ChannelHandle>>,
    connecting: tokio::sync::Mutex<()>,
}

impl Endpoint {
    /// Create an endpoint using the named security profile.
    pub fn new(address: impl Into<String>, profile: impl Into<String>, circuit: CircuitConfig) -> Self {
        Self {
            address: address.into(),
            profile: profile.into(),
            health: Mutex::new(HealthRecord::default()),
            circuit: CircuitBreaker::new(circuit),
            channel: RwLock::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Network address (`host:port`).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Security profile name.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Health snapshot.
    pub fn health(&self) -> HealthRecord {
        self.health.lock().clone()
    }

    /// Current health state.
    pub fn state(&self) -> HealthState {
        self.health.lock().state
    }

    /// Whether this endpoint is flagged as leader.
    pub fn is_leader(&self) -> bool {
        self.health.lock().is_leader
    }

    /// The endpoint's circuit breaker.
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub(crate) fn set_leader(&self, leader: bool) {
        self.health.lock().is_leader = leader;
    }

    /// Dead endpoint whose cooldown has elapsed; claims the retry slot when true.
    pub(crate) fn claim_retry(&self, cooldown: Duration) -> bool {
        let now = Instant::now();
        let mut health = self.health.lock();
        match (health.state, health.dead_since) {
            (HealthState::Dead, Some(since)) if now.duration_since(since) >= cooldown => {
                health.dead_since = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Apply a call outcome to this endpoint's health.
    ///
    /// Leader-hint handling is done by the pool; here NotLeader only clears the
    /// local flag.
    pub(crate) fn apply(&self, outcome: &Outcome, dead_threshold: u32) -> Option<HealthState> {
        let now = Instant::now();
        let transition = {
            let mut health = self.health.lock();
            let before = health.state;
            match outcome {
                Outcome::Success => {
                    health.state = HealthState::Healthy;
                    health.consecutive_failures = 0;
                    health.last_success = Some(now);
                    health.dead_since = None;
                }
                Outcome::TransientFailure => {}
                Outcome::NotLeader { .. } => {
                    health.is_leader = false;
                    health.consecutive_failures = 0;
                    health.last_success = Some(now);
                    if health.state != HealthState::Healthy {
                        health.state = HealthState::Healthy;
                        health.dead_since = None;
                    }
                }
                Outcome::Unreachable => {
                    health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                    if health.consecutive_failures >= dead_threshold {
                        if health.state != HealthState::Dead {
                            health.dead_since = Some(now);
                        }
                        health.state = HealthState::Dead;
                    } else {
                        health.state = HealthState::Suspect;
                    }
                }
            }
            (before != health.state).then_some(health.state)
        };

        match outcome {
            Outcome::Unreachable => {
                self.circuit.on_unreachable();
                self.clear_channel();
            }
            _ => self.circuit.on_reachable(),
        }
        transition
    }

    /// Current channel, if one is installed and was built under `generation`.
    pub(crate) fn current_channel(&self, generation: u64) -> Option<ChannelHandle> {
        self.channel
            .read()
            .as_ref()
            .filter(|h| h.generation() == generation && !h.channel().is_closed())
            .cloned()
    }

    pub(crate) fn install_channel(&self, handle: ChannelHandle) {
        *self.channel.write() = Some(handle);
    }

    /// Drop the channel; the next call reconnects.
    pub fn clear_channel(&self) {
        self.channel.write().take();
    }

    /// Whether a channel is currently installed.
    pub fn has_channel(&self) -> bool {
        self.channel.read().is_some()
    }

    pub(crate) fn connect_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.connecting
    }
}
