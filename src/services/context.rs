use serde_json::Value;

use crate::domains::chat::{
    ChatTurnContext, HistoryTurn, KnowledgeSnippet, PersonaProfile, KNOWLEDGE_HEADER,
};
use crate::error::{EngineError, Result};

/// Framing cost charged per chat message on top of its content.
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;
/// Bullet framing charged per knowledge snippet.
const SNIPPET_OVERHEAD_TOKENS: u64 = 1;

/// Approximate token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimated prompt size of rendered chat messages.
pub fn estimate_messages(messages: &[Value]) -> u64 {
    messages
        .iter()
        .map(|message| {
            let content = message
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            estimate_tokens(content) + MESSAGE_OVERHEAD_TOKENS
        })
        .sum()
}

/// Assembles the bounded prompt for one chat turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Fills `token_budget` with, in order: the persona instructions (never
    /// truncated), the user message, knowledge snippets by descending
    /// relevance (a snippet that does not fit is skipped), then the newest
    /// history turns until one does not fit. Deterministic for equal inputs.
    pub fn build(
        &self,
        persona: &PersonaProfile,
        snippets: &[KnowledgeSnippet],
        history: &[HistoryTurn],
        user_message: &str,
        token_budget: u64,
    ) -> Result<ChatTurnContext> {
        let system_cost = estimate_tokens(&persona.instructions) + MESSAGE_OVERHEAD_TOKENS;
        if system_cost > token_budget {
            return Err(EngineError::ConfigurationAnomaly(format!(
                "persona {} instructions need ~{system_cost} tokens, budget is {token_budget}",
                persona.id
            )));
        }
        let message_cost = estimate_tokens(user_message) + MESSAGE_OVERHEAD_TOKENS;
        let mut used = system_cost + message_cost;
        if used > token_budget {
            return Err(EngineError::InvalidInput(format!(
                "message needs ~{message_cost} tokens, only {} fit the prompt",
                token_budget - system_cost
            )));
        }

        let mut ranked: Vec<&KnowledgeSnippet> = snippets.iter().collect();
        ranked.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

        let header_cost = estimate_tokens(KNOWLEDGE_HEADER);
        let mut knowledge = Vec::new();
        for snippet in ranked {
            let mut cost = estimate_tokens(&snippet.content) + SNIPPET_OVERHEAD_TOKENS;
            if knowledge.is_empty() {
                cost += header_cost;
            }
            if used + cost <= token_budget {
                used += cost;
                knowledge.push(snippet.clone());
            }
        }

        let mut window = Vec::new();
        for turn in history.iter().rev() {
            let cost = estimate_tokens(&turn.content) + MESSAGE_OVERHEAD_TOKENS;
            if used + cost > token_budget {
                break;
            }
            used += cost;
            window.push(turn.clone());
        }
        window.reverse();

        Ok(ChatTurnContext {
            system_prompt: persona.instructions.clone(),
            knowledge,
            history: window,
            user_message: user_message.to_string(),
            token_budget,
            estimated_tokens: used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_round_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("héllo"), 2);
    }
}
