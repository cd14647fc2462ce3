//! Lease records.
//!
//! `LeaseID → LeaseRecord{ttl, deadline, status, missed, attached_keys}`
//!
//! The deadline is the client's estimate of when the server expires the lease:
//! the time of the last successful keep-alive plus the TTL it returned. A lease
//! adopted from another client has no deadline until its TTL is learned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of a lease as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Granted, no keep-alive yet.
    Granted,
    /// At least one keep-alive succeeded.
    Alive,
    /// Expired on the server, or presumed expired after missed keep-alives.
    Expired,
    /// Revoked by this client or found gone on the server.
    Revoked,
}

impl LeaseStatus {
    /// Expired and Revoked are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, LeaseStatus::Expired | LeaseStatus::Revoked)
    }
}

/// A lease tracked by the client.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    pub lease_id: i64,

    /// TTL last granted or renewed by the server.
    pub ttl: Duration,

    /// Estimated server-side expiry.
    pub deadline: Instant,

    pub status: LeaseStatus,

    /// Consecutive keep-alives that failed.
    pub missed: u32,

    /// False for an adopted lease until the server reported its TTL.
    pub ttl_known: bool,

    /// Keys written with this lease. Advisory only.
    pub attached_keys: HashSet<Vec<u8>>,
}

impl LeaseRecord {
    /// A freshly granted lease.
    pub fn new(lease_id: i64, ttl_seconds: i64, now: Instant) -> Self {
        let ttl = ttl_from_seconds(ttl_seconds);
        Self {
            lease_id,
            ttl,
            deadline: now + ttl,
            status: LeaseStatus::Granted,
            missed: 0,
            ttl_known: true,
            attached_keys: HashSet::new(),
        }
    }

    /// A lease granted elsewhere. Its TTL and deadline are unknown.
    pub fn adopted(lease_id: i64, now: Instant) -> Self {
        Self {
            ttl_known: false,
            ..Self::new(lease_id, 0, now)
        }
    }

    /// The server reported `granted` seconds of TTL with `remaining` left.
    pub fn learn_ttl(&mut self, granted: i64, remaining: i64, now: Instant) {
        self.ttl = ttl_from_seconds(granted);
        self.deadline = now + ttl_from_seconds(remaining);
        self.ttl_known = true;
    }

    /// When the next keep-alive should go out: `fraction` of the TTL before
    /// the deadline. After a miss, halfway between `now` and the deadline.
    pub fn next_heartbeat(&self, fraction: f64, now: Instant) -> Instant {
        if !self.ttl_known {
            return now;
        }
        if self.missed > 0 {
            let left = self.deadline.saturating_duration_since(now);
            return now + left / 2;
        }
        let lead = self.ttl.mul_f64(fraction.clamp(0.0, 1.0));
        self.deadline.checked_sub(lead).unwrap_or(now).max(now)
    }

    /// Time left before the estimated expiry.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// A keep-alive returned `ttl_seconds`.
    pub fn on_keep_alive(&mut self, ttl_seconds: i64, now: Instant) {
        self.ttl = ttl_from_seconds(ttl_seconds);
        self.deadline = now + self.ttl;
        self.missed = 0;
        self.ttl_known = true;
        if !self.status.is_terminal() {
            self.status = LeaseStatus::Alive;
        }
    }

    /// A keep-alive failed. Returns true when the lease is now Expired.
    pub fn on_missed(&mut self, limit: u32) -> bool {
        self.missed += 1;
        if self.missed >= limit.max(1) {
            self.expire();
        }
        self.status == LeaseStatus::Expired
    }

    pub fn expire(&mut self) {
        if !self.status.is_terminal() {
            self.status = LeaseStatus::Expired;
        }
    }

    pub fn revoke(&mut self) {
        self.status = LeaseStatus::Revoked;
    }

    /// Attach a key to this lease.
    pub fn attach_key(&mut self, key: Vec<u8>) {
        self.attached_keys.insert(key);
    }

    /// Detach a key from this lease.
    pub fn detach_key(&mut self, key: &[u8]) -> bool {
        self.attached_keys.remove(key)
    }
}

/// Final status of leases that are no longer tracked, oldest evicted first.
#[derive(Debug, Default)]
pub struct RetiredLeases {
    capacity: usize,
    order: VecDeque<i64>,
    status: HashMap<i64, LeaseStatus>,
}

impl RetiredLeases {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            status: HashMap::new(),
        }
    }

    /// Remember that `lease_id` ended as `status`.
    pub fn insert(&mut self, lease_id: i64, status: LeaseStatus) {
        if self.status.insert(lease_id, status).is_none() {
            self.order.push_back(lease_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.status.remove(&oldest);
            }
        }
    }

    pub fn get(&self, lease_id: i64) -> Option<LeaseStatus> {
        self.status.get(&lease_id).copied()
    }

    /// Forget `lease_id`, e.g. when the id is granted again.
    pub fn remove(&mut self, lease_id: i64) {
        if self.status.remove(&lease_id).is_some() {
            self.order.retain(|id| *id != lease_id);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn ttl_from_seconds(ttl_seconds: i64) -> Duration {
    Duration::from_secs(ttl_seconds.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_at_fraction_of_ttl() {
        let now = Instant::now();
        let record = LeaseRecord::new(1, 10, now);
        assert_eq!(record.next_heartbeat(0.5, now), now + Duration::from_secs(5));
        assert_eq!(record.next_heartbeat(0.25, now), now + Duration::from_millis(7500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_deadline() {
        let start = Instant::now();
        let mut record = LeaseRecord::new(1, 10, start);
        let later = start + Duration::from_secs(4);
        record.on_keep_alive(10, later);
        assert_eq!(record.status, LeaseStatus::Alive);
        assert_eq!(record.deadline, later + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_misses_expire() {
        let now = Instant::now();
        let mut record = LeaseRecord::new(1, 10, now);
        assert!(!record.on_missed(2));
        assert_eq!(
            record.next_heartbeat(0.5, now + Duration::from_secs(6)),
            now + Duration::from_secs(8)
        );
        assert!(record.on_missed(2));
        assert_eq!(record.status, LeaseStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_missed() {
        let now = Instant::now();
        let mut record = LeaseRecord::new(1, 10, now);
        record.on_missed(2);
        record.on_keep_alive(10, now);
        assert!(!record.on_missed(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_is_sticky() {
        let mut record = LeaseRecord::new(1, 10, Instant::now());
        record.revoke();
        record.expire();
        record.on_keep_alive(10, Instant::now());
        assert_eq!(record.status, LeaseStatus::Revoked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopted_lease_waits_for_ttl() {
        let now = Instant::now();
        let mut record = LeaseRecord::adopted(7, now);
        assert!(!record.ttl_known);
        assert_eq!(record.next_heartbeat(0.5, now), now);

        record.learn_ttl(30, 20, now);
        assert!(record.ttl_known);
        assert_eq!(record.deadline, now + Duration::from_secs(20));
        assert_eq!(record.next_heartbeat(0.5, now), now + Duration::from_secs(5));
    }

    #[test]
    fn test_retired_leases_bounded() {
        let mut retired = RetiredLeases::new(2);
        retired.insert(1, LeaseStatus::Revoked);
        retired.insert(2, LeaseStatus::Expired);
        retired.insert(2, LeaseStatus::Expired);
        assert_eq!(retired.len(), 2);

        retired.insert(3, LeaseStatus::Expired);
        assert_eq!(retired.len(), 2);
        assert_eq!(retired.get(1), None);
        assert_eq!(retired.get(3), Some(LeaseStatus::Expired));

        retired.remove(2);
        assert_eq!(retired.get(2), None);
        assert_eq!(retired.len(), 1);
    }

    #[test]
    fn test_attached_keys() {
        let mut record = LeaseRecord::new(1, 10, Instant::now());
        record.attach_key(b"a".to_vec());
        record.attach_key(b"a".to_vec());
        assert_eq!(record.attached_keys.len(), 1);
        assert!(record.detach_key(b"a"));
        assert!(!record.detach_key(b"a"));
    }
}
