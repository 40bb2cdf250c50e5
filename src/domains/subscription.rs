use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domains::tier::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Grace,
    Expired,
    None,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Grace => "grace",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::None => "none",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "active" => Ok(SubscriptionStatus::Active),
            "grace" => Ok(SubscriptionStatus::Grace),
            "expired" => Ok(SubscriptionStatus::Expired),
            "none" => Ok(SubscriptionStatus::None),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    /// `None` never expires.
    pub expires_at: Option<i64>,
    /// Set only while in grace.
    pub grace_until: Option<i64>,
    pub auto_renew: bool,
    pub last_verified_event_id: Option<String>,
    pub last_event_at: Option<i64>,
    /// Optimistic concurrency token; 0 for a record not yet persisted.
    pub version: i64,
    pub updated_at: i64,
}

impl SubscriptionRecord {
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            tier: Tier::Free,
            status: SubscriptionStatus::None,
            expires_at: None,
            grace_until: None,
            auto_renew: false,
            last_verified_event_id: None,
            last_event_at: None,
            version: 0,
            updated_at: 0,
        }
    }

    /// Tier granted right now. Grace keeps the purchased tier.
    pub fn effective_tier(&self) -> Tier {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::Grace => self.tier,
            SubscriptionStatus::Expired | SubscriptionStatus::None => Tier::Free,
        }
    }
}

/// A verified purchase delivered by the purchase-verification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseEvent {
    pub event_id: String,
    pub user_id: String,
    /// Tier name or plan id.
    pub tier: String,
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub renewal: bool,
    pub issued_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationEvent {
    pub event_id: String,
    pub user_id: String,
    /// Refunds and chargebacks end access immediately, skipping grace.
    #[serde(default)]
    pub refund: bool,
    pub issued_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    Duplicate,
    Stale,
    Rejected,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Duplicate => "duplicate",
            EventOutcome::Stale => "stale",
            EventOutcome::Rejected => "rejected",
        }
    }
}

impl FromStr for EventOutcome {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "applied" => Ok(EventOutcome::Applied),
            "duplicate" => Ok(EventOutcome::Duplicate),
            "stale" => Ok(EventOutcome::Stale),
            "rejected" => Ok(EventOutcome::Rejected),
            _ => Err(()),
        }
    }
}

/// One row of the processed-event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionEventLog {
    pub event_id: String,
    pub user_id: String,
    pub kind: String,
    pub tier: Option<String>,
    pub expires_at: Option<i64>,
    pub issued_at: i64,
    pub outcome: EventOutcome,
    pub recorded_at: i64,
}
