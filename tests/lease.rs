//! Lease integration tests.
//!
//! Tests for grant, background keep-alive, local expiry after missed
//! heartbeats, idempotent revoke and TTL queries.

mod common;

use common::MockCluster;
use futures::StreamExt;
use lattice_client::core::error::ClientError;
use lattice_client::kv::proto;
use lattice_client::{CallOptions, LeaseKeeper, LeaseRenewal, LeaseStatus, PutOptions};
use std::time::Duration;
use tokio::time::Instant;

const A: &str = "10.0.0.1:2379";

async fn next_item(keeper: &mut LeaseKeeper) -> Option<Result<LeaseRenewal, ClientError>> {
    tokio::time::timeout(Duration::from_secs(120), keeper.next())
        .await
        .expect("timed out waiting for keeper")
}

// ============================================================================
// Grant and keep-alive
// ============================================================================

#[tokio::test(start_paused = true)]
async fn grant_registers_lease() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();

    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();
    assert_eq!(grant.ttl, 10);
    assert!(cluster.has_lease(grant.id));
    assert_eq!(client.lease_status(grant.id), Some(LeaseStatus::Granted));
}

#[tokio::test(start_paused = true)]
async fn grant_with_caller_id() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();

    let grant = client
        .grant_lease_with_id(5, 77, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(grant.id, 77);
}

#[tokio::test(start_paused = true)]
async fn non_positive_ttl_rejected() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();

    let err = client.grant_lease(0, CallOptions::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidRequest { .. }));
    assert!(cluster.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn keeper_renews_at_half_ttl() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();

    let start = Instant::now();
    let mut keeper = client.keep_alive_lease(grant.id).unwrap();
    let renewal = next_item(&mut keeper).await.unwrap().unwrap();
    assert_eq!(renewal.ttl, 10);

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "renewed after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "renewed after {elapsed:?}");
    assert_eq!(keeper.status(), LeaseStatus::Alive);
}

#[tokio::test(start_paused = true)]
async fn kept_lease_stays_alive() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(4, CallOptions::new()).await.unwrap();

    let mut keeper = client.keep_alive_lease(grant.id).unwrap();
    for _ in 0..10 {
        next_item(&mut keeper).await.unwrap().unwrap();
    }
    assert_eq!(keeper.status(), LeaseStatus::Alive);
    assert!(keeper.deadline() > Instant::now());
    assert!(cluster.keep_alive_count() >= 10);
}

#[tokio::test(start_paused = true)]
async fn second_keeper_for_same_lease_rejected() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();

    let keeper = client.keep_alive_lease(grant.id).unwrap();
    assert!(matches!(
        client.keep_alive_lease(grant.id),
        Err(ClientError::InvalidRequest { .. })
    ));

    // A stopped keeper frees the slot.
    keeper.stop();
    drop(keeper);
    client.keep_alive_lease(grant.id).unwrap();
}

#[tokio::test(start_paused = true)]
async fn one_keep_alive_in_flight_per_lease() {
    let cluster = MockCluster::new(&[A]);
    cluster.set_keep_alive_latency(Duration::from_millis(100));
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(30, CallOptions::new()).await.unwrap();

    let calls: Vec<_> = (0..4)
        .map(|_| client.keep_alive_once(grant.id, CallOptions::new()))
        .collect();
    for result in futures::future::join_all(calls).await {
        result.unwrap();
    }
    assert_eq!(cluster.keep_alive_count(), 4);
    assert_eq!(cluster.max_concurrent_keep_alives(), 1);
}

// ============================================================================
// Expiry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn two_missed_keep_alives_expire_locally() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();

    let start = Instant::now();
    let mut keeper = client.keep_alive_lease(grant.id).unwrap();
    cluster.fail_keep_alives(true);

    match next_item(&mut keeper).await {
        Some(Err(ClientError::LeaseExpired { lease_id })) => assert_eq!(lease_id, grant.id),
        other => panic!("unexpected {other:?}"),
    }
    // Both misses happen before the server-side deadline.
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(client.lease_status(grant.id), Some(LeaseStatus::Expired));
    assert!(cluster.has_lease(grant.id));
    assert!(next_item(&mut keeper).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn single_miss_then_recovery_stays_alive() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().max_retries(0).build().unwrap();
    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();

    let mut keeper = client.keep_alive_lease(grant.id).unwrap();
    cluster.fail_keep_alives(true);
    // First heartbeat at 5s fails; the retry is scheduled before the deadline.
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    cluster.fail_keep_alives(false);

    let renewal = next_item(&mut keeper).await.unwrap().unwrap();
    assert_eq!(renewal.id, grant.id);
    assert_eq!(keeper.status(), LeaseStatus::Alive);
}

#[tokio::test(start_paused = true)]
async fn expiry_reaches_unpolled_keeper() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();

    let mut keeper = client.keep_alive_lease(grant.id).unwrap();
    // Twenty renewals fill the keeper buffer.
    tokio::time::sleep(Duration::from_secs(100)).await;
    cluster.fail_keep_alives(true);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.lease_status(grant.id), Some(LeaseStatus::Expired));

    let mut items = Vec::new();
    while let Some(item) = next_item(&mut keeper).await {
        items.push(item);
    }
    // Renewals past the buffer were dropped; the terminal error was not.
    assert_eq!(items.len(), 17);
    assert!(items[..16].iter().all(|item| item.is_ok()));
    match items.last() {
        Some(Err(ClientError::LeaseExpired { lease_id })) => assert_eq!(*lease_id, grant.id),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn adopted_lease_needs_two_misses() {
    let cluster = MockCluster::new(&[A]);
    let owner = cluster.builder().build().unwrap();
    let grant = owner.grant_lease(30, CallOptions::new()).await.unwrap();

    let client = cluster.builder().max_retries(0).build().unwrap();
    cluster.fail_keep_alives(true);
    let start = Instant::now();
    let mut keeper = client.keep_alive_lease(grant.id).unwrap();

    // The TTL is learned first, so the first keep-alive goes out at 15s.
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(cluster.calls_to(proto::LEASE_KEEP_ALIVE).len(), 1);
    assert_eq!(keeper.status(), LeaseStatus::Granted);

    match next_item(&mut keeper).await {
        Some(Err(ClientError::LeaseExpired { lease_id })) => assert_eq!(lease_id, grant.id),
        other => panic!("unexpected {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_secs(22));
    assert_eq!(cluster.calls_to(proto::LEASE_KEEP_ALIVE).len(), 2);
    assert!(cluster.has_lease(grant.id));
}

#[tokio::test(start_paused = true)]
async fn adopted_lease_renewed_with_learned_ttl() {
    let cluster = MockCluster::new(&[A]);
    let owner = cluster.builder().build().unwrap();
    let grant = owner.grant_lease(8, CallOptions::new()).await.unwrap();

    let client = cluster.builder().build().unwrap();
    let start = Instant::now();
    let mut keeper = client.keep_alive_lease(grant.id).unwrap();
    let renewal = next_item(&mut keeper).await.unwrap().unwrap();
    assert_eq!(renewal.ttl, 8);
    assert!(start.elapsed() >= Duration::from_secs(4));
    assert_eq!(cluster.calls_to(proto::LEASE_TIME_TO_LIVE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_side_expiry_reported() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();
    cluster.expire_lease(grant.id);

    let err = client
        .keep_alive_once(grant.id, CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::LeaseExpired { .. }));
    assert_eq!(client.lease_status(grant.id), Some(LeaseStatus::Expired));
    assert!(matches!(
        client.keep_alive_lease(grant.id),
        Err(ClientError::LeaseExpired { .. })
    ));
}

// ============================================================================
// Revoke
// ============================================================================

#[tokio::test(start_paused = true)]
async fn revoke_is_idempotent() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();

    client.revoke_lease(grant.id, CallOptions::new()).await.unwrap();
    assert!(!cluster.has_lease(grant.id));
    assert_eq!(client.lease_status(grant.id), Some(LeaseStatus::Revoked));

    client.revoke_lease(grant.id, CallOptions::new()).await.unwrap();
    // Unknown to both sides.
    client.revoke_lease(424242, CallOptions::new()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn revoke_ends_keeper() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();
    let mut keeper = client.keep_alive_lease(grant.id).unwrap();

    client.revoke_lease(grant.id, CallOptions::new()).await.unwrap();
    match next_item(&mut keeper).await {
        Some(Err(ClientError::LeaseRevoked { lease_id })) => assert_eq!(lease_id, grant.id),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        client.keep_alive_lease(grant.id),
        Err(ClientError::LeaseRevoked { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn revoke_deletes_attached_keys() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();

    client
        .put("session/1", "up", PutOptions::new().with_lease(grant.id))
        .await
        .unwrap();
    assert_eq!(client.lease_keys(grant.id), vec![b"session/1".to_vec()]);

    client.revoke_lease(grant.id, CallOptions::new()).await.unwrap();
    assert!(cluster.value("session/1").is_none());
}

#[tokio::test(start_paused = true)]
async fn ended_leases_are_not_tracked() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();

    let mut ids = Vec::new();
    for _ in 0..50 {
        ids.push(client.grant_lease(10, CallOptions::new()).await.unwrap().id);
    }
    assert_eq!(client.leases().tracked(), 50);
    for id in &ids {
        client.revoke_lease(*id, CallOptions::new()).await.unwrap();
    }
    assert_eq!(client.leases().tracked(), 0);
    assert_eq!(client.lease_status(ids[0]), Some(LeaseStatus::Revoked));

    let grant = client.grant_lease(10, CallOptions::new()).await.unwrap();
    let mut keeper = client.keep_alive_lease(grant.id).unwrap();
    cluster.fail_keep_alives(true);
    assert!(matches!(
        next_item(&mut keeper).await,
        Some(Err(ClientError::LeaseExpired { .. }))
    ));
    assert_eq!(client.leases().tracked(), 0);
    assert_eq!(client.lease_status(grant.id), Some(LeaseStatus::Expired));
}

#[tokio::test(start_paused = true)]
async fn adopted_lease_forgotten_when_keeper_stops() {
    let cluster = MockCluster::new(&[A]);
    let owner = cluster.builder().build().unwrap();
    let grant = owner.grant_lease(10, CallOptions::new()).await.unwrap();

    let client = cluster.builder().build().unwrap();
    let mut keeper = client.keep_alive_lease(grant.id).unwrap();
    next_item(&mut keeper).await.unwrap().unwrap();
    assert_eq!(client.leases().tracked(), 1);

    drop(keeper);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.leases().tracked(), 0);
    assert_eq!(client.lease_status(grant.id), None);
    assert!(cluster.has_lease(grant.id));
}

// ============================================================================
// Time to live
// ============================================================================

#[tokio::test(start_paused = true)]
async fn time_to_live_with_keys() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();
    let grant = client.grant_lease(20, CallOptions::new()).await.unwrap();
    client
        .put("a", "1", PutOptions::new().with_lease(grant.id))
        .await
        .unwrap();

    let ttl = client
        .lease_time_to_live(grant.id, true, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(ttl.granted_ttl, 20);
    assert_eq!(ttl.keys, vec![b"a".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn time_to_live_of_unknown_lease() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();

    let err = client
        .lease_time_to_live(9, false, CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::LeaseNotFound { lease_id: 9 }));
}

#[tokio::test(start_paused = true)]
async fn put_with_unknown_lease_fails() {
    let cluster = MockCluster::new(&[A]);
    let client = cluster.builder().build().unwrap();

    let err = client
        .put("k", "v", PutOptions::new().with_lease(31337))
        .await
        .unwrap_err();
    assert!(err.root().is_not_found());
}
