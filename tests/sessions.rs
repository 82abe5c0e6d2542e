//! Session sliding expiration and cache round trips.

mod common;

use common::{fake_factory, tenant_a, tenant_b};
use redgate::{ProgressState, ProgressTracker, SessionStore, TenantCache};
use redgate_connection::fake::FakeStore;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn sliding_expiration_keeps_active_sessions_alive() {
    let store = FakeStore::new();
    // Scaled-down TTL: 500 ms plays the role of the 60 s default.
    let sessions = SessionStore::with_ttl(fake_factory(&store).await, Duration::from_millis(500));
    let tenant = tenant_a();
    let user = Uuid::new_v4();

    let session = sessions
        .create(&tenant, &user, serde_json::json!({}))
        .await
        .unwrap();

    // Halfway through the TTL: valid, and the expiry slides forward.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let validated = sessions
        .validate(&tenant, &session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert!(validated.expires_at > session.expires_at);

    // Past the original expiry but inside the extension: still valid.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sessions
        .validate(&tenant, &session.session_id)
        .await
        .unwrap()
        .is_some());

    // Left idle past the last extension: invalid.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(sessions
        .validate(&tenant, &session.session_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn cache_round_trips_within_ttl_and_stays_tenant_scoped() {
    let store = FakeStore::new();
    let factory = fake_factory(&store).await;
    let cache = TenantCache::new(factory);

    cache
        .write(
            &tenant_a(),
            "k",
            serde_json::json!("va"),
            Duration::from_secs(60),
            &[],
        )
        .await
        .unwrap();
    cache
        .write(
            &tenant_b(),
            "k",
            serde_json::json!("vb"),
            Duration::from_secs(60),
            &[],
        )
        .await
        .unwrap();

    let a = cache.read(&tenant_a(), "k").await.unwrap().unwrap();
    let b = cache.read(&tenant_b(), "k").await.unwrap().unwrap();
    assert_eq!(a.payload, serde_json::json!("va"));
    assert_eq!(b.payload, serde_json::json!("vb"));
}

#[tokio::test]
async fn expired_cache_entries_read_as_misses() {
    let store = FakeStore::new();
    let cache = TenantCache::new(fake_factory(&store).await);

    cache
        .write(
            &tenant_a(),
            "short",
            serde_json::json!(1),
            Duration::from_millis(100),
            &[],
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cache.read(&tenant_a(), "short").await.unwrap().is_none());
}

#[tokio::test]
async fn progress_moves_monotonically_to_a_terminal_state() {
    let store = FakeStore::new();
    let tracker = ProgressTracker::new(fake_factory(&store).await);
    let tenant = tenant_a();
    let id = Uuid::new_v4();

    tracker.start(&tenant, &id, 4).await.unwrap();
    tracker.update_step(&tenant, &id, 2, "halfway").await.unwrap();
    tracker.increment(&tenant, &id, "almost").await.unwrap();
    let done = tracker.complete(&tenant, &id, "finished").await.unwrap();
    assert_eq!(done.state(), ProgressState::Completed);
    assert_eq!(done.current_step, 4);

    // Terminal states cannot be reopened.
    assert!(tracker.update_step(&tenant, &id, 1, "again").await.is_err());
    assert!(tracker.fail(&tenant, &id, "too late").await.is_err());
}
