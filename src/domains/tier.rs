use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Pro,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Premium, Tier::Pro];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Pro => "pro",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts tier names and purchasable plan ids (`premium_monthly` resolves
/// to `premium`).
impl FromStr for Tier {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            "pro" => Ok(Tier::Pro),
            other => Plan::by_id(other).map(|plan| plan.tier).ok_or(()),
        }
    }
}

/// Numeric limits for one tier. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_messages_per_day: Option<u64>,
    pub max_tokens_per_day: Option<u64>,
    pub max_personas: Option<u64>,
    pub max_storage_bytes: Option<u64>,
    pub history_retention_days: Option<u32>,
}

const MIB: u64 = 1024 * 1024;

impl TierLimits {
    pub fn defaults_for(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self {
                max_messages_per_day: Some(25),
                max_tokens_per_day: Some(100_000),
                max_personas: Some(3),
                max_storage_bytes: Some(50 * MIB),
                history_retention_days: Some(3),
            },
            Tier::Basic => Self {
                max_messages_per_day: Some(100),
                max_tokens_per_day: Some(400_000),
                max_personas: Some(10),
                max_storage_bytes: Some(500 * MIB),
                history_retention_days: Some(30),
            },
            Tier::Premium => Self {
                max_messages_per_day: None,
                max_tokens_per_day: Some(2_000_000),
                max_personas: None,
                max_storage_bytes: Some(5 * 1024 * MIB),
                history_retention_days: None,
            },
            Tier::Pro => Self {
                max_messages_per_day: None,
                max_tokens_per_day: None,
                max_personas: None,
                max_storage_bytes: None,
                history_retention_days: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: &'static str,
    pub name: &'static str,
    pub tier: Tier,
    /// `None` for plans that never expire.
    pub duration_days: Option<i64>,
    pub product_id: &'static str,
    pub price_cents: u32,
}

static PLANS: [Plan; 4] = [
    Plan {
        id: "premium_daily",
        name: "Premium Daily",
        tier: Tier::Premium,
        duration_days: Some(1),
        product_id: "com.aipersona.premium.daily",
        price_cents: 99,
    },
    Plan {
        id: "premium_monthly",
        name: "Premium Monthly",
        tier: Tier::Premium,
        duration_days: Some(30),
        product_id: "com.aipersona.premium.monthly",
        price_cents: 999,
    },
    Plan {
        id: "premium_yearly",
        name: "Premium Yearly",
        tier: Tier::Premium,
        duration_days: Some(365),
        product_id: "com.aipersona.premium.yearly",
        price_cents: 5999,
    },
    Plan {
        id: "lifetime",
        name: "Lifetime Premium",
        tier: Tier::Pro,
        duration_days: None,
        product_id: "com.aipersona.premium.lifetime",
        price_cents: 14999,
    },
];

impl Plan {
    pub fn all() -> &'static [Plan] {
        &PLANS
    }

    pub fn by_id(id: &str) -> Option<&'static Plan> {
        PLANS.iter().find(|plan| plan.id == id)
    }

    pub fn by_product_id(product_id: &str) -> Option<&'static Plan> {
        PLANS.iter().find(|plan| plan.product_id == product_id)
    }
}
