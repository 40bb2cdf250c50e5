mod common;

use std::sync::Arc;

use common::{memory_engine, ManualClock, ScriptedProvider, DAY, START_TS};
use persona_engine::config::{Config, QuotaConfig, TierOverride, TiersConfig};
use persona_engine::domains::subscription::PurchaseEvent;
use persona_engine::domains::tier::Tier;
use persona_engine::domains::usage::CounterKind;
use persona_engine::interfaces::scheduler::JobTick;
use persona_engine::scheduler::jobs::DAILY_RESET;
use persona_engine::{Action, DenialReason, PersonaEngine};

fn engine(config: &Config, clock: Arc<ManualClock>) -> PersonaEngine {
    memory_engine(config, Arc::new(ScriptedProvider::replying("hi")), clock)
}

#[tokio::test]
async fn free_user_hits_daily_message_limit_until_reset() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let engine = engine(&Config::default(), clock.clone());

    for _ in 0..25 {
        let decision = engine
            .gate
            .authorize("u1", Action::SendMessage)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.tier, Tier::Free);
        assert_eq!(decision.reserved_cost(), 7000);
        let reservation = decision.reservation.unwrap();
        engine.ledger.reconcile(&reservation, 300).await.unwrap();
    }

    let denied = engine
        .gate
        .authorize("u1", Action::SendMessage)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.reason, Some(DenialReason::DailyMessageLimit));
    assert!(denied.reservation.is_none());

    let snapshot = engine.ledger.snapshot("u1").await.unwrap();
    assert_eq!(snapshot.messages_sent, 25);
    // The denied attempt handed its token reservation back.
    assert_eq!(snapshot.tokens_consumed, 25 * 300);

    clock.advance(DAY);
    let job = engine.job(DAILY_RESET).unwrap();
    assert!(matches!(job.run().await.unwrap(), JobTick::Ran { .. }));

    let decision = engine
        .gate
        .authorize("u1", Action::SendMessage)
        .await
        .unwrap();
    assert!(decision.allowed);
}

#[tokio::test]
async fn token_ceiling_denies_before_message_slot_is_taken() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let config = Config {
        tiers: Some(TiersConfig {
            free: Some(TierOverride {
                max_tokens_per_day: Some(5000),
                ..TierOverride::default()
            }),
            ..TiersConfig::default()
        }),
        quota: Some(QuotaConfig {
            reserved_tokens_per_message: Some(2000),
            ..QuotaConfig::default()
        }),
        ..Config::default()
    };
    let engine = engine(&config, clock);

    for _ in 0..2 {
        assert!(
            engine
                .gate
                .authorize("u1", Action::SendMessage)
                .await
                .unwrap()
                .allowed
        );
    }
    let denied = engine
        .gate
        .authorize("u1", Action::SendMessage)
        .await
        .unwrap();
    assert_eq!(denied.reason, Some(DenialReason::DailyTokenLimit));
    let snapshot = engine.ledger.snapshot("u1").await.unwrap();
    assert_eq!(snapshot.messages_sent, 2);
    assert_eq!(snapshot.tokens_consumed, 4000);
}

#[tokio::test]
async fn premium_purchase_lifts_message_limit() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let engine = engine(&Config::default(), clock);
    engine
        .subscriptions
        .apply_purchase(&PurchaseEvent {
            event_id: "evt-1".to_string(),
            user_id: "u1".to_string(),
            tier: "premium_monthly".to_string(),
            expires_at: None,
            renewal: false,
            issued_at: START_TS,
        })
        .await
        .unwrap();

    for _ in 0..40 {
        let decision = engine
            .gate
            .authorize("u1", Action::SendMessage)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.tier, Tier::Premium);
        let reservation = decision.reservation.unwrap();
        engine.ledger.reconcile(&reservation, 100).await.unwrap();
    }
    assert_eq!(
        engine.ledger.snapshot("u1").await.unwrap().tokens_consumed,
        4000
    );
}

#[tokio::test]
async fn persona_and_storage_limits_apply() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let engine = engine(&Config::default(), clock);

    for _ in 0..3 {
        assert!(
            engine
                .gate
                .authorize("u1", Action::CreatePersona)
                .await
                .unwrap()
                .allowed
        );
    }
    let denied = engine
        .gate
        .authorize("u1", Action::CreatePersona)
        .await
        .unwrap();
    assert_eq!(denied.reason, Some(DenialReason::PersonaLimit));

    engine
        .ledger
        .release("u1", CounterKind::Personas, 1)
        .await
        .unwrap();
    assert!(
        engine
            .gate
            .authorize("u1", Action::CreatePersona)
            .await
            .unwrap()
            .allowed
    );

    let upload = engine
        .gate
        .authorize(
            "u1",
            Action::UploadFile {
                bytes: 60 * 1024 * 1024,
            },
        )
        .await
        .unwrap();
    assert_eq!(upload.reason, Some(DenialReason::StorageLimit));
    assert_eq!(
        engine.ledger.snapshot("u1").await.unwrap().storage_bytes_used,
        0
    );
}
