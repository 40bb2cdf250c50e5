mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{ManualClock, DAY, START_TS};
use persona_engine::domains::subscription::{
    CancellationEvent, EventOutcome, PurchaseEvent, SubscriptionStatus,
};
use persona_engine::domains::tier::Tier;
use persona_engine::error::EngineError;
use persona_engine::interfaces::stores::SubscriptionStore;
use persona_engine::providers::memory::InMemoryStore;
use persona_engine::providers::sqlite::SqliteStore;
use persona_engine::services::subscription::SubscriptionService;

fn purchase(event_id: &str, tier: &str, issued_at: i64) -> PurchaseEvent {
    PurchaseEvent {
        event_id: event_id.to_string(),
        user_id: "u1".to_string(),
        tier: tier.to_string(),
        expires_at: None,
        renewal: false,
        issued_at,
    }
}

fn cancel(event_id: &str, refund: bool, issued_at: i64) -> CancellationEvent {
    CancellationEvent {
        event_id: event_id.to_string(),
        user_id: "u1".to_string(),
        refund,
        issued_at,
    }
}

fn service(store: Arc<dyn SubscriptionStore>, clock: Arc<ManualClock>) -> SubscriptionService {
    SubscriptionService::new(store, clock, 3)
}

async fn monthly_plan_lapses_through_grace(subscriptions: &SubscriptionService, clock: &ManualClock) {
    let result = subscriptions
        .apply_purchase(&purchase("evt-1", "premium_monthly", START_TS))
        .await
        .unwrap();
    assert_eq!(result.outcome, EventOutcome::Applied);
    assert_eq!(result.record.status, SubscriptionStatus::Active);
    assert_eq!(result.record.expires_at, Some(START_TS + 30 * DAY));
    assert_eq!(subscriptions.effective_tier("u1").await.unwrap(), Tier::Premium);

    clock.set(START_TS + 30 * DAY + 60);
    let report = subscriptions.sweep().await.unwrap();
    assert_eq!(report.entered_grace, 1);
    assert_eq!(report.expired, 0);
    let record = subscriptions.status("u1").await.unwrap();
    assert_eq!(record.status, SubscriptionStatus::Grace);
    assert_eq!(record.grace_until, Some(START_TS + 33 * DAY));
    assert_eq!(record.effective_tier(), Tier::Premium);

    clock.set(START_TS + 33 * DAY);
    let report = subscriptions.sweep().await.unwrap();
    assert_eq!(report.expired, 1);
    let record = subscriptions.status("u1").await.unwrap();
    assert_eq!(record.status, SubscriptionStatus::Expired);
    assert_eq!(record.tier, Tier::Premium);
    assert_eq!(record.effective_tier(), Tier::Free);

    assert_eq!(subscriptions.sweep().await.unwrap().total(), 0);
}

#[tokio::test]
async fn monthly_plan_lapses_through_grace_in_memory() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock.clone());
    monthly_plan_lapses_through_grace(&subscriptions, &clock).await;
}

#[tokio::test]
async fn monthly_plan_lapses_through_grace_in_sqlite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("subs.db");
    let store = Arc::new(SqliteStore::new(path.to_str().unwrap()).await.unwrap());
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(store, clock.clone());
    monthly_plan_lapses_through_grace(&subscriptions, &clock).await;
}

#[tokio::test]
async fn unknown_users_are_free() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock);
    let record = subscriptions.status("nobody").await.unwrap();
    assert_eq!(record.status, SubscriptionStatus::None);
    assert_eq!(record.effective_tier(), Tier::Free);
    assert_eq!(record.expires_at, None);
}

#[tokio::test]
async fn replayed_event_is_applied_once() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock.clone());

    let first = subscriptions
        .apply_purchase(&purchase("evt-1", "basic", START_TS))
        .await
        .unwrap();
    clock.advance(10);
    let replay = subscriptions
        .apply_purchase(&purchase("evt-1", "basic", START_TS))
        .await
        .unwrap();

    assert_eq!(replay.outcome, EventOutcome::Duplicate);
    assert_eq!(replay.record.version, first.record.version);
    assert_eq!(replay.record.updated_at, first.record.updated_at);
    let events = subscriptions.events("u1", 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, EventOutcome::Applied);
}

#[tokio::test]
async fn older_event_is_discarded() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock);

    subscriptions
        .apply_purchase(&purchase("evt-upgrade", "pro", START_TS + 100))
        .await
        .unwrap();
    let stale = subscriptions
        .apply_purchase(&purchase("evt-downgrade", "basic", START_TS + 50))
        .await;

    assert!(matches!(stale, Err(EngineError::SubscriptionConflict(_))));
    let record = subscriptions.status("u1").await.unwrap();
    assert_eq!(record.tier, Tier::Pro);
    assert_eq!(record.last_verified_event_id.as_deref(), Some("evt-upgrade"));
    let events = subscriptions.events("u1", 10).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_id == "evt-downgrade" && e.outcome == EventOutcome::Stale));
}

#[tokio::test]
async fn lifetime_plan_never_expires() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock.clone());
    let result = subscriptions
        .apply_purchase(&purchase("evt-1", "lifetime", START_TS))
        .await
        .unwrap();
    assert_eq!(result.record.tier, Tier::Pro);
    assert_eq!(result.record.expires_at, None);

    clock.advance(3650 * DAY);
    assert_eq!(subscriptions.sweep().await.unwrap().total(), 0);
    assert_eq!(subscriptions.effective_tier("u1").await.unwrap(), Tier::Pro);
}

#[tokio::test]
async fn cancellation_keeps_access_until_expiry() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock);
    subscriptions
        .apply_purchase(&purchase("evt-1", "premium_monthly", START_TS))
        .await
        .unwrap();

    let result = subscriptions
        .apply_cancellation(&cancel("evt-2", false, START_TS + 10))
        .await
        .unwrap();
    assert_eq!(result.record.status, SubscriptionStatus::Active);
    assert!(!result.record.auto_renew);
    assert_eq!(result.record.effective_tier(), Tier::Premium);
}

#[tokio::test]
async fn refund_expires_immediately() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock);
    subscriptions
        .apply_purchase(&purchase("evt-1", "premium_yearly", START_TS))
        .await
        .unwrap();

    let result = subscriptions
        .apply_cancellation(&cancel("evt-2", true, START_TS + 10))
        .await
        .unwrap();
    assert_eq!(result.record.status, SubscriptionStatus::Expired);
    assert_eq!(result.record.effective_tier(), Tier::Free);
}

#[tokio::test]
async fn cancelling_nothing_is_rejected() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock);
    let result = subscriptions
        .apply_cancellation(&cancel("evt-1", false, START_TS))
        .await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition { .. })
    ));
    let events = subscriptions.events("u1", 10).await.unwrap();
    assert_eq!(events[0].outcome, EventOutcome::Rejected);
}

#[tokio::test]
async fn unknown_tier_is_a_configuration_anomaly() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock);
    let result = subscriptions
        .apply_purchase(&purchase("evt-1", "platinum", START_TS))
        .await;
    assert!(matches!(result, Err(EngineError::ConfigurationAnomaly(_))));
    assert_eq!(subscriptions.effective_tier("u1").await.unwrap(), Tier::Free);
}

#[tokio::test]
async fn renewal_in_grace_restores_active() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let subscriptions = service(Arc::new(InMemoryStore::new()), clock.clone());
    subscriptions
        .apply_purchase(&purchase("evt-1", "premium_daily", START_TS))
        .await
        .unwrap();
    clock.set(START_TS + DAY + 1);
    subscriptions.sweep().await.unwrap();
    assert_eq!(
        subscriptions.status("u1").await.unwrap().status,
        SubscriptionStatus::Grace
    );

    let mut renewal = purchase("evt-2", "premium_daily", START_TS + DAY + 5);
    renewal.renewal = true;
    let result = subscriptions.apply_purchase(&renewal).await.unwrap();
    assert_eq!(result.record.status, SubscriptionStatus::Active);
    assert_eq!(result.record.grace_until, None);
    assert_eq!(result.record.expires_at, Some(START_TS + 2 * DAY + 5));
}
