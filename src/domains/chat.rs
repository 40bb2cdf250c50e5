use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Separates persona instructions from the knowledge bullets.
pub const KNOWLEDGE_HEADER: &str = "\n\nRelevant knowledge:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    #[serde(default)]
    pub source: String,
    pub content: String,
    #[serde(default)]
    pub relevance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub id: String,
    pub name: String,
    pub instructions: String,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeSnippet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "assistant" => ChatRole::Assistant,
            "system" => ChatRole::System,
            _ => ChatRole::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: ChatRole,
    pub content: String,
    pub created_at: i64,
}

/// Bounded prompt for one chat turn. Built per request, never shared.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurnContext {
    pub system_prompt: String,
    pub knowledge: Vec<KnowledgeSnippet>,
    /// Chronological.
    pub history: Vec<HistoryTurn>,
    pub user_message: String,
    pub token_budget: u64,
    pub estimated_tokens: u64,
}

impl ChatTurnContext {
    /// Renders the context as OpenAI-style chat messages.
    pub fn to_messages(&self) -> Vec<Value> {
        let mut system = self.system_prompt.clone();
        if !self.knowledge.is_empty() {
            system.push_str(KNOWLEDGE_HEADER);
            for snippet in &self.knowledge {
                system.push_str("\n- ");
                system.push_str(&snippet.content);
            }
        }

        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(json!({ "role": "system", "content": system }));
        for turn in &self.history {
            messages.push(json!({ "role": turn.role.as_str(), "content": turn.content }));
        }
        messages.push(json!({ "role": "user", "content": self.user_message }));
        messages
    }
}

/// What the caller receives from a streaming chat turn. Exactly one terminal
/// chunk (`Done` or `Error`) ends every stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Token {
        text: String,
    },
    Done {
        finish_reason: String,
        total_tokens: u64,
    },
    Error {
        message: String,
        partial_tokens: u64,
    },
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamChunk::Token { .. })
    }
}
