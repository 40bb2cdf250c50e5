use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domains::chat::{KnowledgeSnippet, PersonaProfile};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One incremental event from the generative-AI upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub event_type: String,
    pub delta: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

impl ChatEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            event_type: "delta".to_string(),
            delta: Some(text.into()),
            finish_reason: None,
            usage: None,
            error: None,
        }
    }

    pub fn finished(finish_reason: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            event_type: "finish".to_string(),
            delta: None,
            finish_reason: Some(finish_reason.into()),
            usage,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Overrides the provider's configured model.
    pub model: Option<String>,
    pub max_tokens: Option<u64>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Opens a streaming completion. The stream ends after a `finish` event,
    /// or yields an `Err` item when the upstream fails.
    fn chat_stream(
        &self,
        messages: Vec<Value>,
        options: ChatOptions,
    ) -> BoxStream<'static, Result<ChatEvent>>;
}

/// Read-only persona and knowledge-base collaborator.
#[async_trait]
pub trait PersonaSource: Send + Sync {
    async fn persona(&self, persona_id: &str) -> Result<Option<PersonaProfile>>;

    /// Snippets for the persona, most relevant first.
    async fn knowledge(&self, persona_id: &str, query: &str) -> Result<Vec<KnowledgeSnippet>>;
}
