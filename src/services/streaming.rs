use std::sync::Arc;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domains::chat::StreamChunk;
use crate::domains::usage::Reservation;
use crate::interfaces::providers::{ChatOptions, LlmProvider, TokenUsage};
use crate::services::context::estimate_tokens;
use crate::services::ledger::QuotaLedger;

/// Settles a token reservation exactly once. If the stream is dropped before
/// it settles (client disconnect), the tokens counted so far are reconciled
/// on a spawned task.
///
/// `consumed` is the estimated size of the completion text already relayed.
/// When a stream errors or is cancelled that estimate is the whole charge:
/// prompt tokens the upstream may have billed are not counted against the
/// user. Only a finished stream settles with the upstream-reported total.
struct Settlement {
    ledger: Arc<QuotaLedger>,
    reservation: Option<Reservation>,
    consumed: u64,
}

impl Settlement {
    fn new(ledger: Arc<QuotaLedger>, reservation: Option<Reservation>) -> Self {
        Self {
            ledger,
            reservation,
            consumed: 0,
        }
    }

    async fn settle(&mut self, actual: u64) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        if let Err(err) = self.ledger.reconcile(&reservation, actual).await {
            warn!(
                user_id = %reservation.user_id,
                reservation_id = %reservation.id,
                actual,
                error = %err,
                "failed to reconcile streamed tokens"
            );
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        let actual = self.consumed;
        let ledger = self.ledger.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(
                    user_id = %reservation.user_id,
                    reservation_id = %reservation.id,
                    actual,
                    "stream cancelled, reconciling partial usage"
                );
                handle.spawn(async move {
                    if let Err(err) = ledger.reconcile(&reservation, actual).await {
                        warn!(
                            reservation_id = %reservation.id,
                            error = %err,
                            "failed to reconcile cancelled stream"
                        );
                    }
                });
            }
            Err(_) => warn!(
                reservation_id = %reservation.id,
                actual,
                "no runtime to reconcile cancelled stream; reservation stays charged"
            ),
        }
    }
}

/// Relays upstream completions to the caller as [`StreamChunk`]s and bills
/// the real token cost back to the ledger.
pub struct StreamingProxy {
    llm: Arc<dyn LlmProvider>,
    ledger: Arc<QuotaLedger>,
}

impl StreamingProxy {
    pub fn new(llm: Arc<dyn LlmProvider>, ledger: Arc<QuotaLedger>) -> Self {
        Self { llm, ledger }
    }

    /// Every returned stream ends with exactly one terminal chunk. The
    /// reservation is reconciled before that chunk is yielded: with the
    /// upstream-reported total on success, otherwise with the estimated
    /// tokens already delivered.
    pub fn stream(
        &self,
        messages: Vec<Value>,
        options: ChatOptions,
        reservation: Option<Reservation>,
    ) -> BoxStream<'static, StreamChunk> {
        let llm = self.llm.clone();
        let user_id = reservation
            .as_ref()
            .map(|r| r.user_id.clone())
            .unwrap_or_default();
        // Built outside the generator so a stream dropped before its first
        // poll still releases the reservation.
        let mut settlement = Settlement::new(self.ledger.clone(), reservation);

        Box::pin(stream! {
            let mut upstream = llm.chat_stream(messages, options);
            let mut finish: Option<(String, Option<TokenUsage>)> = None;

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(event) => {
                        if let Some(text) = event.delta.filter(|text| !text.is_empty()) {
                            settlement.consumed += estimate_tokens(&text);
                            yield StreamChunk::Token { text };
                        }
                        if let Some(message) = event.error {
                            let partial = settlement.consumed;
                            warn!(user_id = %user_id, partial_tokens = partial, error = %message, "upstream reported an error");
                            settlement.settle(partial).await;
                            yield StreamChunk::Error {
                                message: "the assistant failed to respond, retry later".to_string(),
                                partial_tokens: partial,
                            };
                            return;
                        }
                        if let Some(reason) = event.finish_reason {
                            finish = Some((reason, event.usage));
                            break;
                        }
                    }
                    Err(err) => {
                        let partial = settlement.consumed;
                        warn!(user_id = %user_id, partial_tokens = partial, error = %err, "upstream stream failed");
                        settlement.settle(partial).await;
                        yield StreamChunk::Error {
                            message: err.public_message(),
                            partial_tokens: partial,
                        };
                        return;
                    }
                }
            }

            match finish {
                Some((finish_reason, usage)) => {
                    let total_tokens = usage
                        .map(|usage| usage.total_tokens)
                        .unwrap_or(settlement.consumed);
                    settlement.settle(total_tokens).await;
                    info!(user_id = %user_id, total_tokens, finish_reason = %finish_reason, "chat stream completed");
                    yield StreamChunk::Done { finish_reason, total_tokens };
                }
                None => {
                    let partial = settlement.consumed;
                    warn!(user_id = %user_id, partial_tokens = partial, "upstream closed without finishing");
                    settlement.settle(partial).await;
                    yield StreamChunk::Error {
                        message: "the assistant failed to respond, retry later".to_string(),
                        partial_tokens: partial,
                    };
                }
            }
        })
    }
}
