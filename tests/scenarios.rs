//! End-to-end verification scenarios against a single limiter.

use std::sync::Arc;

use keygate::ratelimit::{
    KeyContext, LeaseManager, LimitRequest, ManualClock, OwnerType, RateLimitConfig, RateLimiter,
    WindowStore,
};
use tokio_test::{assert_err, assert_ok};

const NOW: u64 = 1_700_000_000_000;

fn limiter() -> (RateLimiter, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(NOW));
    let limiter = RateLimiter::new(
        Arc::new(WindowStore::new()),
        LeaseManager::new("scenario-secret", 3_600_000),
        clock.clone(),
    );
    (limiter, clock)
}

fn config(
    owner_type: OwnerType,
    owner_id: &str,
    name: &str,
    limit: u32,
    duration_ms: u64,
    auto_apply: bool,
) -> RateLimitConfig {
    RateLimitConfig {
        id: format!("rl_{}_{}", owner_id, name),
        workspace_id: "ws_1".to_string(),
        owner_type,
        owner_id: owner_id.to_string(),
        name: name.to_string(),
        limit,
        duration_ms,
        auto_apply,
    }
}

#[test]
fn minute_limit_exhausts_before_monthly_quota() {
    let (limiter, _) = limiter();
    let mut ctx = KeyContext::new("ws_1", "key_1");
    ctx.key_limits = vec![
        config(OwnerType::Key, "key_1", "per_minute", 12, 60_000, true),
        config(OwnerType::Key, "key_1", "per_month", 200, 2_592_000_000, true),
    ];

    for call in 1..=12u64 {
        let result = assert_ok!(limiter.evaluate(&ctx, &[]));
        assert!(result.success, "call {} should pass", call);
        assert_eq!(result.limit("per_minute").unwrap().remaining, 12 - call);
        assert_eq!(result.limit("per_month").unwrap().remaining, 200 - call);
    }

    let result = assert_ok!(limiter.evaluate(&ctx, &[]));
    assert!(!result.success);
    let minute = result.limit("per_minute").unwrap();
    assert!(minute.exceeded);
    assert_eq!(minute.remaining, 0);
    let month = result.limit("per_month").unwrap();
    assert!(!month.exceeded);
    assert_eq!(month.remaining, 188);
}

#[test]
fn key_limit_takes_precedence_over_identity_limit() {
    let (limiter, _) = limiter();
    let mut ctx = KeyContext::new("ws_1", "key_1");
    ctx.key_limits = vec![config(OwnerType::Key, "key_1", "X", 4, 10_000, false)];
    ctx.identity_limits = vec![config(OwnerType::Identity, "id_1", "X", 1, 600_000, false)];

    for _ in 0..3 {
        let result = assert_ok!(limiter.evaluate(&ctx, &[LimitRequest::named("X")]));
        assert!(result.success);
        assert_eq!(result.limits.len(), 1);
        assert_eq!(result.limits[0].limit, 4);
    }
}

#[test]
fn identity_limits_exhaust_independently() {
    let (limiter, _) = limiter();
    let mut ctx = KeyContext::new("ws_1", "key_1");
    ctx.identity_limits = vec![
        config(OwnerType::Identity, "id_1", "api_requests", 5, 60_000, false),
        config(OwnerType::Identity, "id_1", "data_access", 5, 60_000, false),
    ];
    let requests = [
        LimitRequest::named("api_requests"),
        LimitRequest::named("data_access"),
    ];

    for call in 1..=5u64 {
        let result = assert_ok!(limiter.evaluate(&ctx, &requests));
        assert!(result.success);
        assert_eq!(result.limit("api_requests").unwrap().remaining, 5 - call);
        assert_eq!(result.limit("data_access").unwrap().remaining, 5 - call);
    }

    let result = assert_ok!(limiter.evaluate(&ctx, &requests));
    assert!(!result.success);
    for status in &result.limits {
        assert!(status.exceeded, "{} should be exceeded", status.name);
        assert_eq!(status.remaining, 0);
    }
}

#[test]
fn window_slides_and_recovers() {
    let (limiter, clock) = limiter();
    let mut ctx = KeyContext::new("ws_1", "key_1");
    ctx.key_limits = vec![config(OwnerType::Key, "key_1", "requests", 10, 60_000, true)];

    let window_start = NOW - NOW % 60_000;
    clock.set(window_start);
    for _ in 0..10 {
        assert!(assert_ok!(limiter.evaluate(&ctx, &[])).success);
    }
    assert!(!assert_ok!(limiter.evaluate(&ctx, &[])).success);

    // Halfway through the next window half the previous count still weighs in.
    clock.set(window_start + 90_000);
    let result = assert_ok!(limiter.evaluate(&ctx, &[LimitRequest::named("requests").with_cost(0)]));
    assert_eq!(result.limits[0].remaining, 5);
    assert_eq!(result.limits[0].reset, window_start + 120_000);

    // Two full windows later the old count no longer counts.
    clock.set(window_start + 120_000);
    let result = assert_ok!(limiter.evaluate(&ctx, &[]));
    assert!(result.success);
    assert_eq!(result.limits[0].remaining, 9);
}

#[test]
fn lease_settles_reserved_capacity() {
    let (limiter, _) = limiter();
    let mut ctx = KeyContext::new("ws_1", "key_1");
    ctx.key_limits = vec![config(OwnerType::Key, "key_1", "tokens", 100, 3_600_000, false)];
    let reserve = LimitRequest::named("tokens").with_cost(10);
    let peek = [LimitRequest::named("tokens").with_cost(0)];

    let exact = assert_ok!(limiter.issue_lease(&ctx, &reserve, 60_000));
    let after_issue = assert_ok!(limiter.evaluate(&ctx, &peek)).limits[0].remaining;
    assert_eq!(after_issue, 90);
    let committed = assert_ok!(limiter.commit_lease("ws_1", &exact.lease.unwrap().token, 10));
    assert_eq!(committed.limits[0].remaining, after_issue);

    let partial = assert_ok!(limiter.issue_lease(&ctx, &reserve, 60_000));
    let after_issue = assert_ok!(limiter.evaluate(&ctx, &peek)).limits[0].remaining;
    let committed = assert_ok!(limiter.commit_lease("ws_1", &partial.lease.unwrap().token, 4));
    assert_eq!(committed.limits[0].remaining, after_issue + 6);
}

#[test]
fn lease_is_bound_to_its_workspace() {
    let (limiter, clock) = limiter();
    let ctx = KeyContext::new("ws_1", "key_1");
    let request = LimitRequest::named("adhoc").with_limit(5, 60_000);

    let outcome = assert_ok!(limiter.issue_lease(&ctx, &request, 1_000));
    let token = outcome.lease.unwrap().token;
    assert_err!(limiter.commit_lease("ws_2", &token, 1));

    clock.advance(1_001);
    assert_err!(limiter.commit_lease("ws_1", &token, 1));
}
