#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use futures::stream::BoxStream;
use serde_json::Value;

use persona_engine::clock::Clock;
use persona_engine::config::Config;
use persona_engine::domains::chat::{KnowledgeSnippet, PersonaProfile};
use persona_engine::error::{EngineError, Result};
use persona_engine::interfaces::providers::{ChatEvent, ChatOptions, LlmProvider, TokenUsage};
use persona_engine::providers::memory::InMemoryStore;
use persona_engine::providers::personas::StaticPersonaSource;
use persona_engine::services::ledger::QuotaLedger;
use persona_engine::{EngineParts, PersonaEngine};

/// 2024-03-01T12:00:00Z
pub const START_TS: i64 = 1_709_294_400;
pub const DAY: i64 = 24 * 60 * 60;

pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub enum Ending {
    Finish(Option<TokenUsage>),
    Fail(String),
    /// Never ends; used to simulate a client that walks away mid-stream.
    Hang,
}

/// LLM double that replays a fixed list of deltas and then ends as told.
pub struct ScriptedProvider {
    deltas: Vec<String>,
    ending: Ending,
    calls: AtomicUsize,
    pub requests: Mutex<Vec<Vec<Value>>>,
    pub options: Mutex<Vec<ChatOptions>>,
}

impl ScriptedProvider {
    pub fn new(deltas: Vec<String>, ending: Ending) -> Self {
        Self {
            deltas,
            ending,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(vec![text.to_string()], Ending::Finish(None))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<Vec<Value>> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn last_options(&self) -> Option<ChatOptions> {
        self.options.lock().unwrap().last().cloned()
    }
}

impl LlmProvider for ScriptedProvider {
    fn chat_stream(
        &self,
        messages: Vec<Value>,
        options: ChatOptions,
    ) -> BoxStream<'static, Result<ChatEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages);
        self.options.lock().unwrap().push(options);
        let deltas = self.deltas.clone();
        let ending = self.ending.clone();
        Box::pin(try_stream! {
            for delta in deltas {
                tokio::task::yield_now().await;
                yield ChatEvent::delta(delta);
            }
            match ending {
                Ending::Finish(usage) => yield ChatEvent::finished("stop", usage),
                Ending::Fail(message) => Err(EngineError::Upstream(message))?,
                Ending::Hang => futures::future::pending::<()>().await,
            }
        })
    }
}

pub fn persona(id: &str) -> PersonaProfile {
    PersonaProfile {
        id: id.to_string(),
        name: format!("Persona {id}"),
        instructions: "You are a cheerful ship's cook. Stay in character.".to_string(),
        knowledge: vec![KnowledgeSnippet {
            source: "galley.md".to_string(),
            content: "The galley serves stew on Fridays.".to_string(),
            relevance: 0.9,
        }],
    }
}

pub fn memory_ledger(clock: Arc<ManualClock>) -> (Arc<InMemoryStore>, QuotaLedger) {
    let store = Arc::new(InMemoryStore::new());
    let ledger = QuotaLedger::new(store.clone(), clock);
    (store, ledger)
}

pub fn memory_engine(
    config: &Config,
    llm: Arc<ScriptedProvider>,
    clock: Arc<ManualClock>,
) -> PersonaEngine {
    let personas = Arc::new(StaticPersonaSource::new(vec![persona("cook")]));
    PersonaEngine::with_parts(config, EngineParts::in_memory(llm, personas, clock))
}
