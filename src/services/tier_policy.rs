use std::collections::HashMap;

use tracing::warn;

use crate::config::Config;
use crate::domains::tier::{Tier, TierLimits};

/// Tier to limits mapping. Immutable once built.
#[derive(Debug, Clone)]
pub struct TierPolicy {
    limits: HashMap<Tier, TierLimits>,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            limits: Tier::ALL
                .iter()
                .map(|tier| (*tier, TierLimits::defaults_for(*tier)))
                .collect(),
        }
    }
}

impl TierPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: Tier::ALL
                .iter()
                .map(|tier| (*tier, config.tier_limits(*tier)))
                .collect(),
        }
    }

    pub fn effective_limits(&self, tier: Tier) -> TierLimits {
        self.limits
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierLimits::defaults_for(tier))
    }

    /// Resolves a tier name coming from outside the type system. Anything
    /// unrecognized is treated as free.
    pub fn resolve_tier(&self, name: &str) -> Tier {
        name.parse().unwrap_or_else(|_| {
            warn!(tier = %name, "configuration anomaly: unrecognized tier, applying free limits");
            Tier::Free
        })
    }

    pub fn limits_for_name(&self, name: &str) -> TierLimits {
        self.effective_limits(self.resolve_tier(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tier_fails_closed_to_free() {
        let policy = TierPolicy::new();
        assert_eq!(policy.resolve_tier("platinum"), Tier::Free);
        assert_eq!(
            policy.limits_for_name("platinum"),
            TierLimits::defaults_for(Tier::Free)
        );
        assert_eq!(policy.resolve_tier("premium_yearly"), Tier::Premium);
    }

    #[test]
    fn configured_overrides_are_applied() {
        let config: Config =
            serde_json::from_str(r#"{"tiers":{"pro":{"max_personas":50}}}"#).unwrap();
        let policy = TierPolicy::from_config(&config);
        assert_eq!(policy.effective_limits(Tier::Pro).max_personas, Some(50));
        assert_eq!(policy.effective_limits(Tier::Free).max_messages_per_day, Some(25));
    }
}
