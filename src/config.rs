use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::domains::chat::PersonaProfile;
use crate::domains::tier::{Tier, TierLimits};
use crate::error::{EngineError, Result};

pub const DEFAULT_SQLITE_PATH: &str = "./data/persona-engine.db";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub sqlite_path: Option<String>,
}

/// Per-tier overrides. Missing tiers and missing fields keep the built-in
/// limits; an explicit `null` is not distinguishable from a missing field, so
/// use `unlimited` to lift a limit.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TierOverride {
    pub max_messages_per_day: Option<u64>,
    pub max_tokens_per_day: Option<u64>,
    pub max_personas: Option<u64>,
    pub max_storage_bytes: Option<u64>,
    pub history_retention_days: Option<u32>,
    #[serde(default)]
    pub unlimited: Vec<String>,
}

impl TierOverride {
    pub fn apply(&self, mut limits: TierLimits) -> TierLimits {
        if let Some(value) = self.max_messages_per_day {
            limits.max_messages_per_day = Some(value);
        }
        if let Some(value) = self.max_tokens_per_day {
            limits.max_tokens_per_day = Some(value);
        }
        if let Some(value) = self.max_personas {
            limits.max_personas = Some(value);
        }
        if let Some(value) = self.max_storage_bytes {
            limits.max_storage_bytes = Some(value);
        }
        if let Some(value) = self.history_retention_days {
            limits.history_retention_days = Some(value);
        }
        for field in &self.unlimited {
            match field.as_str() {
                "max_messages_per_day" => limits.max_messages_per_day = None,
                "max_tokens_per_day" => limits.max_tokens_per_day = None,
                "max_personas" => limits.max_personas = None,
                "max_storage_bytes" => limits.max_storage_bytes = None,
                "history_retention_days" => limits.history_retention_days = None,
                _ => {}
            }
        }
        limits
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TiersConfig {
    pub free: Option<TierOverride>,
    pub basic: Option<TierOverride>,
    pub premium: Option<TierOverride>,
    pub pro: Option<TierOverride>,
}

impl TiersConfig {
    pub fn override_for(&self, tier: Tier) -> Option<&TierOverride> {
        match tier {
            Tier::Free => self.free.as_ref(),
            Tier::Basic => self.basic.as_ref(),
            Tier::Premium => self.premium.as_ref(),
            Tier::Pro => self.pro.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    pub grace_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QuotaConfig {
    /// Defaults to `context.token_budget + max_completion_tokens`, so one
    /// reservation covers a full prompt and a capped completion.
    pub reserved_tokens_per_message: Option<u64>,
    pub max_completion_tokens: Option<u64>,
    pub reconcile_tolerance_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub enabled: Option<bool>,
    pub daily_reset_poll_seconds: Option<u64>,
    pub grace_sweep_seconds: Option<u64>,
    pub retention_poll_seconds: Option<u64>,
    pub day_offset_hours: Option<i32>,
    pub job_lease_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContextConfig {
    pub token_budget: Option<u64>,
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub openai: Option<OpenAiConfig>,
    pub database: Option<DatabaseConfig>,
    pub tiers: Option<TiersConfig>,
    pub subscription: Option<SubscriptionConfig>,
    pub quota: Option<QuotaConfig>,
    pub scheduler: Option<SchedulerConfig>,
    pub context: Option<ContextConfig>,
    #[serde(default)]
    pub personas: Vec<PersonaProfile>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| EngineError::Config(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.context_token_budget() == 0 {
            return Err(EngineError::Config(
                "context.token_budget must be positive".to_string(),
            ));
        }
        if self.reserved_tokens_per_message() <= self.max_completion_tokens() {
            return Err(EngineError::Config(format!(
                "quota.reserved_tokens_per_message ({}) leaves no room for a prompt after \
                 quota.max_completion_tokens ({})",
                self.reserved_tokens_per_message(),
                self.max_completion_tokens()
            )));
        }
        let offset = self.day_offset_hours();
        if !(-12..=14).contains(&offset) {
            return Err(EngineError::Config(format!(
                "scheduler.day_offset_hours out of range: {offset}"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for persona in &self.personas {
            if !seen.insert(persona.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate persona id: {}",
                    persona.id
                )));
            }
        }
        Ok(())
    }

    pub fn sqlite_path(&self) -> String {
        self.database
            .as_ref()
            .and_then(|db| db.sqlite_path.clone())
            .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string())
    }

    pub fn tier_limits(&self, tier: Tier) -> TierLimits {
        let defaults = TierLimits::defaults_for(tier);
        match self.tiers.as_ref().and_then(|t| t.override_for(tier)) {
            Some(overrides) => overrides.apply(defaults),
            None => defaults,
        }
    }

    pub fn grace_days(&self) -> u32 {
        self.subscription
            .as_ref()
            .and_then(|s| s.grace_days)
            .unwrap_or(3)
    }

    pub fn reserved_tokens_per_message(&self) -> u64 {
        self.quota
            .as_ref()
            .and_then(|q| q.reserved_tokens_per_message)
            .unwrap_or_else(|| {
                self.context_token_budget()
                    .saturating_add(self.max_completion_tokens())
            })
    }

    pub fn max_completion_tokens(&self) -> u64 {
        self.quota
            .as_ref()
            .and_then(|q| q.max_completion_tokens)
            .unwrap_or(1000)
    }

    pub fn reconcile_tolerance_tokens(&self) -> u64 {
        self.quota
            .as_ref()
            .and_then(|q| q.reconcile_tolerance_tokens)
            .unwrap_or(256)
    }

    pub fn scheduler_enabled(&self) -> bool {
        self.scheduler
            .as_ref()
            .and_then(|s| s.enabled)
            .unwrap_or(true)
    }

    pub fn daily_reset_poll_seconds(&self) -> u64 {
        self.scheduler
            .as_ref()
            .and_then(|s| s.daily_reset_poll_seconds)
            .unwrap_or(60)
    }

    pub fn grace_sweep_seconds(&self) -> u64 {
        self.scheduler
            .as_ref()
            .and_then(|s| s.grace_sweep_seconds)
            .unwrap_or(300)
    }

    pub fn retention_poll_seconds(&self) -> u64 {
        self.scheduler
            .as_ref()
            .and_then(|s| s.retention_poll_seconds)
            .unwrap_or(3600)
    }

    pub fn day_offset_hours(&self) -> i32 {
        self.scheduler
            .as_ref()
            .and_then(|s| s.day_offset_hours)
            .unwrap_or(0)
    }

    pub fn job_lease_seconds(&self) -> i64 {
        self.scheduler
            .as_ref()
            .and_then(|s| s.job_lease_seconds)
            .unwrap_or(900)
    }

    pub fn context_token_budget(&self) -> u64 {
        self.context
            .as_ref()
            .and_then(|c| c.token_budget)
            .unwrap_or(6000)
    }

    pub fn history_limit(&self) -> usize {
        self.context
            .as_ref()
            .and_then(|c| c.history_limit)
            .unwrap_or(40)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.sqlite_path(), DEFAULT_SQLITE_PATH);
        assert_eq!(config.grace_days(), 3);
        assert_eq!(config.max_completion_tokens(), 1000);
        assert_eq!(config.reserved_tokens_per_message(), 7000);
        assert_eq!(config.tier_limits(Tier::Free).max_messages_per_day, Some(25));
    }

    #[test]
    fn tier_overrides_merge_over_builtin_limits() {
        let config: Config = serde_json::from_str(
            r#"{"tiers":{"free":{"max_messages_per_day":10},"basic":{"unlimited":["max_personas"]}}}"#,
        )
        .unwrap();
        let free = config.tier_limits(Tier::Free);
        assert_eq!(free.max_messages_per_day, Some(10));
        assert_eq!(free.max_personas, Some(3));
        assert_eq!(config.tier_limits(Tier::Basic).max_personas, None);
    }

    #[test]
    fn reservation_follows_context_budget_unless_set() {
        let config: Config = serde_json::from_str(
            r#"{"context":{"token_budget":3000},"quota":{"max_completion_tokens":500}}"#,
        )
        .unwrap();
        assert_eq!(config.reserved_tokens_per_message(), 3500);

        let config: Config = serde_json::from_str(
            r#"{"quota":{"reserved_tokens_per_message":800,"max_completion_tokens":800}}"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_duplicate_persona_ids() {
        let config: Config = serde_json::from_str(
            r#"{"personas":[{"id":"a","name":"A","instructions":"x"},{"id":"a","name":"B","instructions":"y"}]}"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }
}
