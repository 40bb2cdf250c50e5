use std::sync::Arc;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::domains::chat::{ChatRole, StreamChunk};
use crate::error::{EngineError, Result};
use crate::interfaces::providers::{ChatOptions, PersonaSource};
use crate::interfaces::stores::ConversationStore;
use crate::services::context::ContextBuilder;
use crate::services::gate::{Action, Authorization, QuotaGate};
use crate::services::streaming::StreamingProxy;

/// Client marker asking the persona to open the conversation.
pub const GREETING_MARKER: &str = "[GREETING]";
const GREETING_PROMPT: &str =
    "Please introduce yourself in character. Give a brief, engaging greeting that shows your personality.";

pub const DEFAULT_TOKEN_BUDGET: u64 = 6000;
pub const DEFAULT_HISTORY_LIMIT: usize = 40;

pub enum ChatOutcome {
    Denied(Authorization),
    Streaming {
        authorization: Authorization,
        chunks: BoxStream<'static, StreamChunk>,
    },
}

pub struct ChatService {
    gate: Arc<QuotaGate>,
    personas: Arc<dyn PersonaSource>,
    conversations: Arc<dyn ConversationStore>,
    proxy: Arc<StreamingProxy>,
    clock: Arc<dyn Clock>,
    builder: ContextBuilder,
    token_budget: u64,
    history_limit: usize,
    max_completion_tokens: Option<u64>,
}

impl ChatService {
    pub fn new(
        gate: Arc<QuotaGate>,
        personas: Arc<dyn PersonaSource>,
        conversations: Arc<dyn ConversationStore>,
        proxy: Arc<StreamingProxy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gate,
            personas,
            conversations,
            proxy,
            clock,
            builder: ContextBuilder::new(),
            token_budget: DEFAULT_TOKEN_BUDGET,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_completion_tokens: None,
        }
    }

    pub fn with_token_budget(mut self, tokens: u64) -> Self {
        self.token_budget = tokens;
        self
    }

    pub fn with_history_limit(mut self, turns: usize) -> Self {
        self.history_limit = turns;
        self
    }

    pub fn with_max_completion_tokens(mut self, tokens: Option<u64>) -> Self {
        self.max_completion_tokens = tokens;
        self
    }

    /// One chat turn. Unknown personas are rejected before any quota is
    /// charged; a denial comes back as `ChatOutcome::Denied`.
    pub async fn send(&self, user_id: &str, persona_id: &str, text: &str) -> Result<ChatOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::InvalidInput("message is empty".to_string()));
        }
        let persona = self
            .personas
            .persona(persona_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("persona {persona_id}")))?;

        let authorization = self.gate.authorize(user_id, Action::SendMessage).await?;
        if !authorization.allowed {
            return Ok(ChatOutcome::Denied(authorization));
        }

        let greeting = text == GREETING_MARKER;
        let user_message = if greeting { GREETING_PROMPT } else { text };

        let prepared = async {
            let knowledge = self.personas.knowledge(persona_id, user_message).await?;
            let history = if greeting {
                Vec::new()
            } else {
                self.conversations
                    .recent(user_id, persona_id, self.history_limit)
                    .await?
            };
            let context = self.builder.build(
                &persona,
                &knowledge,
                &history,
                user_message,
                self.prompt_budget(&authorization),
            )?;
            if !greeting {
                self.conversations
                    .append(user_id, persona_id, ChatRole::User, text, self.clock.now())
                    .await?;
            }
            Ok::<_, EngineError>(context)
        }
        .await;

        let context = match prepared {
            Ok(context) => context,
            Err(err) => {
                if let Some(reservation) = &authorization.reservation {
                    if let Err(release_err) = self.gate.ledger().reconcile(reservation, 0).await {
                        warn!(
                            user_id,
                            reservation_id = %reservation.id,
                            error = %release_err,
                            "failed to hand back reservation after context failure"
                        );
                    }
                }
                return Err(err);
            }
        };

        info!(
            user_id,
            persona_id,
            tier = %authorization.tier,
            prompt_tokens = context.estimated_tokens,
            history_turns = context.history.len(),
            snippets = context.knowledge.len(),
            "starting chat turn"
        );

        let options = ChatOptions {
            model: None,
            max_tokens: self.max_completion_tokens,
        };
        let upstream = self.proxy.stream(
            context.to_messages(),
            options,
            authorization.reservation.clone(),
        );
        let chunks = self.persist_reply(upstream, user_id, persona_id);

        Ok(ChatOutcome::Streaming {
            authorization,
            chunks,
        })
    }

    /// Prompt tokens this turn may spend. With a reservation the prompt and
    /// the completion cap together stay inside the reserved amount.
    fn prompt_budget(&self, authorization: &Authorization) -> u64 {
        match &authorization.reservation {
            Some(reservation) => {
                let completion = self.max_completion_tokens.unwrap_or(0);
                self.token_budget
                    .min(reservation.amount.saturating_sub(completion))
            }
            None => self.token_budget,
        }
    }

    /// Passes chunks through and stores the assistant reply once the stream
    /// completes successfully.
    fn persist_reply(
        &self,
        mut upstream: BoxStream<'static, StreamChunk>,
        user_id: &str,
        persona_id: &str,
    ) -> BoxStream<'static, StreamChunk> {
        let conversations = self.conversations.clone();
        let clock = self.clock.clone();
        let user_id = user_id.to_string();
        let persona_id = persona_id.to_string();

        Box::pin(stream! {
            let mut reply = String::new();
            while let Some(chunk) = upstream.next().await {
                match &chunk {
                    StreamChunk::Token { text } => reply.push_str(text),
                    StreamChunk::Done { .. } => {
                        if !reply.is_empty() {
                            if let Err(err) = conversations
                                .append(&user_id, &persona_id, ChatRole::Assistant, &reply, clock.now())
                                .await
                            {
                                warn!(user_id = %user_id, persona_id = %persona_id, error = %err, "failed to store assistant reply");
                            }
                        }
                    }
                    StreamChunk::Error { .. } => {}
                }
                yield chunk;
            }
        })
    }
}
