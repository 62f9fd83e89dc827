//! Integration coverage for the parts of the engine that need no database:
//! tier derivation over the shipped catalog, feed identity, the audience
//! rule, and the rate-limit state as wired at startup.

use clubserver::achievements::definitions::{definitions, determine_tier, AchievementKind, Tier};
use clubserver::core::rate_limit::{LoginGate, RateLimitConfig, RateLimitState};
use clubserver::feed::audience;
use clubserver::feed::item_id::{FeedItemId, FeedItemKind};
use uuid::Uuid;

#[test]
fn every_graded_achievement_resolves_tiers_at_its_thresholds() {
    for def in definitions() {
        if def.kind != AchievementKind::Automatic || def.tiers.special.is_some() {
            continue;
        }
        let tiers = &def.tiers;
        for (threshold, expected) in [
            (tiers.bronze, Tier::Bronze),
            (tiers.silver, Tier::Silver),
            (tiers.gold, Tier::Gold),
            (tiers.platinum, Tier::Platinum),
        ] {
            let threshold = threshold.expect("graded achievements define all four tiers");
            assert_eq!(
                determine_tier(threshold, tiers),
                Some(expected),
                "{} at {}",
                def.id,
                threshold
            );
            assert_ne!(
                determine_tier(threshold - 1, tiers),
                Some(expected),
                "{} below {}",
                def.id,
                threshold
            );
        }
    }
}

#[test]
fn feed_identity_is_stable_across_requests() {
    let owner = Uuid::new_v4();
    let trick = Uuid::new_v4();
    let first = FeedItemId::new(FeedItemKind::Trick, owner, trick.to_string());
    let second: FeedItemId = first.to_string().parse().unwrap();
    assert_eq!(first, second);
    assert_eq!(second.to_string(), first.to_string());
}

#[test]
fn a_member_following_nobody_still_has_an_audience() {
    let viewer = Uuid::new_v4();
    assert_eq!(audience(viewer, Vec::new()), vec![viewer]);
}

#[tokio::test]
async fn per_ip_budget_denies_the_fourth_request_with_a_retry_hint() {
    let state = RateLimitState::new(RateLimitConfig {
        api_max_requests: 3,
        api_window_ms: 60_000,
        ..RateLimitConfig::default()
    });

    for _ in 0..3 {
        assert!(state.allow_ip("203.0.113.9").await.allowed);
    }
    let denied = state.allow_ip("203.0.113.9").await;
    assert!(!denied.allowed);
    assert!(denied.retry_after_secs.unwrap() >= 1);

    // Another identity is unaffected.
    assert!(state.allow_ip("203.0.113.10").await.allowed);
}

#[tokio::test]
async fn account_budget_is_keyed_by_user_not_ip() {
    let state = RateLimitState::new(RateLimitConfig {
        account_max_requests: 2,
        account_window_ms: 60_000,
        ..RateLimitConfig::default()
    });
    let heavy = Uuid::new_v4();

    assert!(state.allow_account(heavy).await.allowed);
    assert!(state.allow_account(heavy).await.allowed);
    assert!(!state.allow_account(heavy).await.allowed);
    assert!(state.allow_account(Uuid::new_v4()).await.allowed);
}

#[tokio::test]
async fn login_failures_lock_and_success_clears() {
    let state = RateLimitState::new(RateLimitConfig {
        login_max_failures: 2,
        login_window_ms: 60_000,
        ..RateLimitConfig::default()
    });
    let login = state.login();

    assert_eq!(login.check("198.51.100.7").await, LoginGate::Open);
    login.record_failure("198.51.100.7").await;
    login.record_failure("198.51.100.7").await;
    assert!(matches!(
        login.check("198.51.100.7").await,
        LoginGate::Locked { retry_after_minutes } if retry_after_minutes >= 1
    ));

    login.clear("198.51.100.7").await;
    assert_eq!(login.check("198.51.100.7").await, LoginGate::Open);
}
