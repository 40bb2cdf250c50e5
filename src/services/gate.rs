use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::domains::tier::{Tier, TierLimits};
use crate::domains::usage::{CounterKind, Reservation};
use crate::error::{EngineError, Result};
use crate::services::ledger::QuotaLedger;
use crate::services::subscription::SubscriptionService;
use crate::services::tier_policy::TierPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    SendMessage,
    CreatePersona,
    UploadFile { bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    DailyMessageLimit,
    DailyTokenLimit,
    PersonaLimit,
    StorageLimit,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::DailyMessageLimit => "daily_message_limit",
            DenialReason::DailyTokenLimit => "daily_token_limit",
            DenialReason::PersonaLimit => "persona_limit",
            DenialReason::StorageLimit => "storage_limit",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            DenialReason::DailyMessageLimit => "Daily message limit reached. Upgrade for more.",
            DenialReason::DailyTokenLimit => "Daily usage limit reached. Try again tomorrow.",
            DenialReason::PersonaLimit => "Persona limit reached for your plan.",
            DenialReason::StorageLimit => "Storage limit reached for your plan.",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DenialReason {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "daily_message_limit" => Ok(DenialReason::DailyMessageLimit),
            "daily_token_limit" => Ok(DenialReason::DailyTokenLimit),
            "persona_limit" => Ok(DenialReason::PersonaLimit),
            "storage_limit" => Ok(DenialReason::StorageLimit),
            _ => Err(()),
        }
    }
}

/// Allow/deny decision for one metered action. A denial is a normal outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authorization {
    pub allowed: bool,
    pub reason: Option<DenialReason>,
    /// Provisional token charge for message sends; reconcile it when the
    /// real cost is known.
    pub reservation: Option<Reservation>,
    pub tier: Tier,
    pub limits: TierLimits,
}

impl Authorization {
    pub fn reserved_cost(&self) -> u64 {
        self.reservation.as_ref().map(|r| r.amount).unwrap_or(0)
    }

    fn allow(tier: Tier, limits: TierLimits, reservation: Option<Reservation>) -> Self {
        Self {
            allowed: true,
            reason: None,
            reservation,
            tier,
            limits,
        }
    }

    fn deny(tier: Tier, limits: TierLimits, reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            reservation: None,
            tier,
            limits,
        }
    }
}

pub struct QuotaGate {
    subscriptions: Arc<SubscriptionService>,
    policy: Arc<TierPolicy>,
    ledger: Arc<QuotaLedger>,
    reserved_tokens_per_message: u64,
}

impl QuotaGate {
    pub fn new(
        subscriptions: Arc<SubscriptionService>,
        policy: Arc<TierPolicy>,
        ledger: Arc<QuotaLedger>,
        reserved_tokens_per_message: u64,
    ) -> Self {
        Self {
            subscriptions,
            policy,
            ledger,
            reserved_tokens_per_message,
        }
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn reserved_tokens_per_message(&self) -> u64 {
        self.reserved_tokens_per_message
    }

    /// Resolves the caller's effective tier and charges the action against
    /// its limits. Storage and lookup failures surface as `Unavailable`.
    pub async fn authorize(&self, user_id: &str, action: Action) -> Result<Authorization> {
        self.authorize_inner(user_id, action)
            .await
            .map_err(|err| match err {
                EngineError::Storage(_) | EngineError::Runtime(_) | EngineError::Http(_) => {
                    error!(user_id, ?action, error = %err, "quota authorization failed");
                    EngineError::unavailable("authorize")
                }
                other => other,
            })
    }

    async fn authorize_inner(&self, user_id: &str, action: Action) -> Result<Authorization> {
        let tier = self.subscriptions.effective_tier(user_id).await?;
        let limits = self.policy.effective_limits(tier);

        let decision = match action {
            Action::SendMessage => self.authorize_message(user_id, tier, limits).await?,
            Action::CreatePersona => {
                let outcome = self
                    .ledger
                    .check_and_increment(user_id, CounterKind::Personas, 1, limits.max_personas)
                    .await?;
                if outcome.allowed {
                    Authorization::allow(tier, limits, None)
                } else {
                    Authorization::deny(tier, limits, DenialReason::PersonaLimit)
                }
            }
            Action::UploadFile { bytes } => {
                let outcome = self
                    .ledger
                    .check_and_increment(
                        user_id,
                        CounterKind::StorageBytes,
                        bytes,
                        limits.max_storage_bytes,
                    )
                    .await?;
                if outcome.allowed {
                    Authorization::allow(tier, limits, None)
                } else {
                    Authorization::deny(tier, limits, DenialReason::StorageLimit)
                }
            }
        };

        if let Some(reason) = decision.reason {
            debug!(user_id, tier = %tier, reason = %reason, "action denied by quota");
        }
        Ok(decision)
    }

    /// Tokens are reserved before the message slot is taken, so a burst of
    /// sends cannot collectively overrun the daily token ceiling. A message
    /// denial hands the reservation back.
    async fn authorize_message(
        &self,
        user_id: &str,
        tier: Tier,
        limits: TierLimits,
    ) -> Result<Authorization> {
        let Some(reservation) = self
            .ledger
            .reserve(
                user_id,
                self.reserved_tokens_per_message,
                limits.max_tokens_per_day,
            )
            .await?
        else {
            return Ok(Authorization::deny(
                tier,
                limits,
                DenialReason::DailyTokenLimit,
            ));
        };

        let outcome = match self
            .ledger
            .check_and_increment(user_id, CounterKind::Messages, 1, limits.max_messages_per_day)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.cancel_reservation(&reservation).await;
                return Err(err);
            }
        };
        if !outcome.allowed {
            self.cancel_reservation(&reservation).await;
            return Ok(Authorization::deny(
                tier,
                limits,
                DenialReason::DailyMessageLimit,
            ));
        }
        Ok(Authorization::allow(tier, limits, Some(reservation)))
    }

    async fn cancel_reservation(&self, reservation: &Reservation) {
        if let Err(err) = self.ledger.reconcile(reservation, 0).await {
            warn!(
                user_id = %reservation.user_id,
                reservation_id = %reservation.id,
                error = %err,
                "failed to hand back token reservation"
            );
        }
    }
}
