//! Rate limiting scenarios: sliding-window denial and recovery, token
//! bucket laws, and the fail-open policy.

mod common;

use common::{fake_factory, tenant_a};
use redgate::{LimitKind, RateLimitConfig, RateLimitError, RateLimiter, RateLimiterConfig};
use redgate_connection::fake::FakeStore;
use redgate_connection::CommandError;
use std::time::Duration;

async fn limiter(store: &FakeStore) -> RateLimiter {
    RateLimiter::new(fake_factory(store).await, RateLimiterConfig::default())
}

#[tokio::test]
async fn sliding_window_denies_with_reset_then_recovers() {
    let store = FakeStore::new();
    let limiter = limiter(&store).await;
    let config = RateLimitConfig::new(3, Duration::from_secs(2));
    let tenant = tenant_a();

    // Three checks fill the window.
    for _ in 0..3 {
        let decision = limiter
            .check_sliding(&tenant, LimitKind::User, "u-1", config, 1)
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    // The fourth, half a second in, is denied with reset ~= 2 s.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let denied = limiter
        .check_sliding(&tenant, LimitKind::User, "u-1", config, 1)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.reset, Duration::from_secs(2));

    // Past the window, checks pass again.
    tokio::time::sleep(Duration::from_millis(1700)).await;
    let recovered = limiter
        .check_sliding(&tenant, LimitKind::User, "u-1", config, 1)
        .await
        .unwrap();
    assert!(recovered.allowed);
}

#[tokio::test]
async fn repeated_checks_admit_exactly_the_limit() {
    let store = FakeStore::new();
    let limiter = limiter(&store).await;
    let config = RateLimitConfig::new(5, Duration::from_secs(60));
    let tenant = tenant_a();

    let mut allowed = 0;
    for _ in 0..8 {
        let decision = limiter
            .check_sliding(&tenant, LimitKind::User, "u-1", config, 1)
            .await
            .unwrap();
        if decision.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);
}

#[tokio::test]
async fn token_bucket_spends_capacity_then_waits_for_refill() {
    let store = FakeStore::new();
    let limiter = limiter(&store).await;
    let tenant = tenant_a();

    // Spending the whole capacity at once is allowed exactly once.
    let first = limiter
        .check_token_bucket(&tenant, "bucket-1", 10, 2.0, 10)
        .await
        .unwrap();
    assert!(first.allowed);
    assert_eq!(first.remaining, 0);

    let denied = limiter
        .check_token_bucket(&tenant, "bucket-1", 10, 2.0, 1)
        .await
        .unwrap();
    assert!(!denied.allowed);
    // One token refills in 1/r = 0.5 s; ceil gives a one-second hint.
    assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));

    // After the refill interval, a single-token request passes.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let refilled = limiter
        .check_token_bucket(&tenant, "bucket-1", 10, 2.0, 1)
        .await
        .unwrap();
    assert!(refilled.allowed);
}

#[tokio::test]
async fn concurrent_checks_never_admit_past_the_limit() {
    let store = FakeStore::new();
    let limiter = std::sync::Arc::new(limiter(&store).await);
    let config = RateLimitConfig::new(10, Duration::from_secs(60));
    let tenant = tenant_a();

    // 40 checks race against a limit of 10; the atomic script keeps the
    // admitted count exact regardless of interleaving.
    let mut handles = Vec::new();
    for _ in 0..40 {
        let limiter = std::sync::Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter
                .check_sliding(&tenant, LimitKind::User, "shared", config, 1)
                .await
                .unwrap()
                .allowed
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn invalid_cost_is_rejected_before_io() {
    let store = FakeStore::new();
    let limiter = limiter(&store).await;
    store.clear_touched();

    let err = limiter
        .check_sliding(
            &tenant_a(),
            LimitKind::User,
            "u-1",
            RateLimitConfig::new(3, Duration::from_secs(1)),
            0,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RateLimitError::InvalidCost(0)));
    assert!(store.touched_keys().is_empty(), "no I/O happened");
}

#[tokio::test]
async fn store_outage_fails_open_without_counting() {
    let store = FakeStore::new();
    let limiter = limiter(&store).await;
    let config = RateLimitConfig::new(2, Duration::from_secs(60));
    let tenant = tenant_a();

    // Fill the window while healthy.
    limiter
        .check_sliding(&tenant, LimitKind::User, "u-1", config, 2)
        .await
        .unwrap();

    // Down: requests are admitted anyway.
    store.fail_with(CommandError::Connection("down".to_string()));
    for _ in 0..3 {
        let decision = limiter
            .check_sliding(&tenant, LimitKind::User, "u-1", config, 1)
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    // Back up: the window still remembers only the pre-outage events.
    store.clear_failure();
    let denied = limiter
        .check_sliding(&tenant, LimitKind::User, "u-1", config, 1)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.current, 2);
}
