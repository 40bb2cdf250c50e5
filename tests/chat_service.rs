mod common;

use std::sync::Arc;

use futures::StreamExt;

use common::{persona, Ending, ManualClock, ScriptedProvider, START_TS};
use persona_engine::config::{Config, ContextConfig, QuotaConfig};
use persona_engine::domains::chat::{ChatRole, StreamChunk};
use persona_engine::services::context::estimate_messages;
use persona_engine::error::EngineError;
use persona_engine::interfaces::stores::ConversationStore;
use persona_engine::providers::memory::InMemoryStore;
use persona_engine::providers::personas::StaticPersonaSource;
use persona_engine::{ChatOutcome, DenialReason, EngineParts, PersonaEngine};

struct Harness {
    engine: PersonaEngine,
    store: Arc<InMemoryStore>,
    llm: Arc<ScriptedProvider>,
}

fn harness(config: &Config, llm: ScriptedProvider) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(llm);
    let parts = EngineParts {
        usage: store.clone(),
        subscriptions: store.clone(),
        jobs: store.clone(),
        conversations: store.clone(),
        personas: Arc::new(StaticPersonaSource::new(vec![persona("cook")])),
        llm: llm.clone(),
        clock: Arc::new(ManualClock::new(START_TS)),
    };
    Harness {
        engine: PersonaEngine::with_parts(config, parts),
        store,
        llm,
    }
}

async fn drain(outcome: ChatOutcome) -> Vec<StreamChunk> {
    match outcome {
        ChatOutcome::Streaming { chunks, .. } => chunks.collect().await,
        ChatOutcome::Denied(decision) => panic!("unexpected denial: {:?}", decision.reason),
    }
}

#[tokio::test]
async fn turn_is_stored_and_fed_back_as_history() {
    let h = harness(&Config::default(), ScriptedProvider::replying("Stew tonight!"));

    let chunks = drain(h.engine.chat.send("u1", "cook", "What's cooking?").await.unwrap()).await;
    assert!(matches!(chunks.last(), Some(StreamChunk::Done { .. })));

    let turns = h.store.recent("u1", "cook", 10).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, ChatRole::User);
    assert_eq!(turns[0].content, "What's cooking?");
    assert_eq!(turns[1].role, ChatRole::Assistant);
    assert_eq!(turns[1].content, "Stew tonight!");

    drain(h.engine.chat.send("u1", "cook", "And tomorrow?").await.unwrap()).await;
    let messages = h.llm.last_request().unwrap();
    let roles: Vec<&str> = messages
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    assert!(messages[0]["content"]
        .as_str()
        .unwrap()
        .contains("stew on Fridays"));
    assert_eq!(messages[3]["content"], "And tomorrow?");
}

#[tokio::test]
async fn greeting_uses_no_history_and_stores_only_the_reply() {
    let h = harness(&Config::default(), ScriptedProvider::replying("Ahoy, I'm Cook!"));
    drain(h.engine.chat.send("u1", "cook", "Earlier question").await.unwrap()).await;

    drain(h.engine.chat.send("u1", "cook", "[GREETING]").await.unwrap()).await;

    let messages = h.llm.last_request().unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[1]["content"]
        .as_str()
        .unwrap()
        .contains("introduce yourself"));
    let turns = h.store.recent("u1", "cook", 10).await.unwrap();
    assert_eq!(turns.len(), 3);
    assert!(turns.iter().all(|t| t.content != "[GREETING]"));
}

#[tokio::test]
async fn unknown_persona_costs_nothing() {
    let h = harness(&Config::default(), ScriptedProvider::replying("hi"));
    let result = h.engine.chat.send("u1", "ghost", "hello").await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
    let snapshot = h.engine.ledger.snapshot("u1").await.unwrap();
    assert_eq!(snapshot.messages_sent, 0);
    assert_eq!(snapshot.tokens_consumed, 0);
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn oversized_message_hands_back_the_reservation() {
    let config = Config {
        context: Some(ContextConfig {
            token_budget: Some(200),
            history_limit: None,
        }),
        ..Config::default()
    };
    let h = harness(&config, ScriptedProvider::replying("hi"));

    let result = h.engine.chat.send("u1", "cook", &"long ".repeat(400)).await;

    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    let snapshot = h.engine.ledger.snapshot("u1").await.unwrap();
    assert_eq!(snapshot.messages_sent, 1);
    assert_eq!(snapshot.tokens_consumed, 0);
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn prompt_and_completion_fit_the_reservation() {
    let h = harness(&Config::default(), ScriptedProvider::replying("Aye"));
    let outcome = h.engine.chat.send("u1", "cook", "What's for supper?").await.unwrap();
    let reserved = match &outcome {
        ChatOutcome::Streaming { authorization, .. } => authorization.reserved_cost(),
        ChatOutcome::Denied(decision) => panic!("unexpected denial: {:?}", decision.reason),
    };
    drain(outcome).await;

    assert_eq!(reserved, 7000);
    let max_tokens = h.llm.last_options().unwrap().max_tokens.unwrap();
    assert_eq!(max_tokens, 1000);
    let prompt = estimate_messages(&h.llm.last_request().unwrap());
    assert!(prompt + max_tokens <= reserved);
}

#[tokio::test]
async fn small_reservation_shrinks_the_prompt_budget() {
    let config = Config {
        quota: Some(QuotaConfig {
            reserved_tokens_per_message: Some(1200),
            max_completion_tokens: Some(1000),
            ..QuotaConfig::default()
        }),
        ..Config::default()
    };
    let h = harness(&config, ScriptedProvider::replying("hi"));

    // About 500 tokens: inside the 6000-token context budget but not inside
    // the 200 tokens the reservation leaves for the prompt.
    let result = h.engine.chat.send("u1", "cook", &"word ".repeat(400)).await;

    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    assert_eq!(h.engine.ledger.snapshot("u1").await.unwrap().tokens_consumed, 0);
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn failed_reply_is_not_stored() {
    let h = harness(
        &Config::default(),
        ScriptedProvider::new(vec!["partial".to_string()], Ending::Fail("boom".to_string())),
    );
    let chunks = drain(h.engine.chat.send("u1", "cook", "hello").await.unwrap()).await;
    assert!(matches!(chunks.last(), Some(StreamChunk::Error { .. })));

    let turns = h.store.recent("u1", "cook", 10).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, ChatRole::User);
}

#[tokio::test]
async fn denial_returns_reason_without_calling_upstream() {
    let h = harness(&Config::default(), ScriptedProvider::replying("ok"));
    for _ in 0..25 {
        drain(h.engine.chat.send("u1", "cook", "hi").await.unwrap()).await;
    }
    let calls = h.llm.calls();

    match h.engine.chat.send("u1", "cook", "hi").await.unwrap() {
        ChatOutcome::Denied(decision) => {
            assert_eq!(decision.reason, Some(DenialReason::DailyMessageLimit))
        }
        ChatOutcome::Streaming { .. } => panic!("expected denial"),
    }
    assert_eq!(h.llm.calls(), calls);
}
