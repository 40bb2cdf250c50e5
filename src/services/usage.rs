use std::sync::Arc;

use serde::Serialize;

use crate::clock::{days_between, parse_day, shift_day};
use crate::domains::subscription::SubscriptionStatus;
use crate::domains::tier::{Tier, TierLimits};
use crate::domains::usage::ArchivedDay;
use crate::error::{EngineError, Result};
use crate::services::ledger::QuotaLedger;
use crate::services::subscription::SubscriptionService;
use crate::services::tier_policy::TierPolicy;

pub const MAX_HISTORY_DAYS: i64 = 90;
pub const DEFAULT_ANALYTICS_DAYS: i64 = 30;

/// Share of the daily message limit above which a user is flagged as likely
/// to hit it.
const LIKELY_TO_HIT_PERCENT: f64 = 80.0;
/// Trend needs more archived days than this to say anything.
const MIN_TREND_DAYS: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub user_id: String,
    pub day: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub expires_at: Option<i64>,
    pub grace_until: Option<i64>,
    pub messages_today: u64,
    pub tokens_today: u64,
    pub personas: u64,
    pub storage_bytes: u64,
    pub limits: TierLimits,
    /// Share of the daily message limit used; `None` when unlimited.
    pub usage_percentage: Option<f64>,
}

/// Archived days in a range, with totals over the range.
#[derive(Debug, Clone, Serialize)]
pub struct UsageHistory {
    pub user_id: String,
    pub from: String,
    pub to: String,
    pub days: Vec<ArchivedDay>,
    pub total_messages: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageTrend {
    Increasing,
    Decreasing,
    Stable,
    InsufficientData,
}

impl UsageTrend {
    /// Compares the mean daily messages of the later half of `days` with the
    /// earlier half. More than 20% up is increasing, more than 20% down is
    /// decreasing.
    pub fn of(days: &[ArchivedDay]) -> Self {
        if days.len() <= MIN_TREND_DAYS {
            return UsageTrend::InsufficientData;
        }
        let (earlier, later) = days.split_at(days.len() / 2);
        let mean = |days: &[ArchivedDay]| {
            days.iter().map(|d| d.messages_sent).sum::<u64>() as f64 / days.len() as f64
        };
        let (earlier, later) = (mean(earlier), mean(later));
        if later > earlier * 1.2 {
            UsageTrend::Increasing
        } else if later < earlier * 0.8 {
            UsageTrend::Decreasing
        } else {
            UsageTrend::Stable
        }
    }
}

/// Usage over the closed days before today plus today's live report.
#[derive(Debug, Clone, Serialize)]
pub struct UsageAnalytics {
    pub current: UsageReport,
    pub period_days: i64,
    pub total_messages: u64,
    pub total_tokens: u64,
    /// Messages per day over the whole period, rounded to two places.
    pub daily_average: f64,
    pub peak_day: Option<String>,
    pub peak_messages: u64,
    pub trend: UsageTrend,
    pub likely_to_hit_limit: bool,
    /// Set for free and basic users whose usage is increasing.
    pub recommended_upgrade: bool,
}

/// Read side of the ledger for dashboards. Never mutates counters.
pub struct UsageService {
    ledger: Arc<QuotaLedger>,
    subscriptions: Arc<SubscriptionService>,
    policy: Arc<TierPolicy>,
}

impl UsageService {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        subscriptions: Arc<SubscriptionService>,
        policy: Arc<TierPolicy>,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            policy,
        }
    }

    pub async fn current(&self, user_id: &str) -> Result<UsageReport> {
        let record = self.subscriptions.status(user_id).await?;
        let tier = record.effective_tier();
        let limits = self.policy.effective_limits(tier);
        let counter = self.ledger.snapshot(user_id).await?;

        let usage_percentage = limits.max_messages_per_day.map(|limit| {
            if limit == 0 {
                100.0
            } else {
                (counter.messages_sent as f64 / limit as f64 * 100.0).min(100.0)
            }
        });

        Ok(UsageReport {
            user_id: user_id.to_string(),
            day: counter.day,
            tier,
            status: record.status,
            expires_at: record.expires_at,
            grace_until: record.grace_until,
            messages_today: counter.messages_sent,
            tokens_today: counter.tokens_consumed,
            personas: counter.personas_owned,
            storage_bytes: counter.storage_bytes_used,
            limits,
            usage_percentage,
        })
    }

    /// Archived days in `[from_day, to_day]`, oldest first. `to_day` defaults
    /// to today and `from_day` to the widest allowed window before it.
    pub async fn history(
        &self,
        user_id: &str,
        from_day: Option<&str>,
        to_day: Option<&str>,
    ) -> Result<UsageHistory> {
        let to_day = match to_day {
            Some(day) => valid_day(day)?,
            None => self.ledger.today(),
        };
        let from_day = match from_day {
            Some(day) => valid_day(day)?,
            None => shift_day(&to_day, -(MAX_HISTORY_DAYS - 1))
                .ok_or_else(|| EngineError::InvalidInput(format!("bad day {to_day}")))?,
        };

        let span = days_between(&from_day, &to_day)
            .ok_or_else(|| EngineError::InvalidInput("bad day range".to_string()))?;
        if span < 0 {
            return Err(EngineError::InvalidInput(format!(
                "from {from_day} is after to {to_day}"
            )));
        }
        if span >= MAX_HISTORY_DAYS {
            return Err(EngineError::InvalidInput(format!(
                "history range is limited to {MAX_HISTORY_DAYS} days"
            )));
        }
        let days = self.ledger.archived(user_id, &from_day, &to_day).await?;
        Ok(UsageHistory {
            user_id: user_id.to_string(),
            total_messages: days.iter().map(|d| d.messages_sent).sum(),
            total_tokens: days.iter().map(|d| d.tokens_consumed).sum(),
            from: from_day,
            to: to_day,
            days,
        })
    }

    /// Summarises the `days` closed days before today (default 30, at most
    /// 90). Days without an archived row count as idle.
    pub async fn analytics(&self, user_id: &str, days: Option<i64>) -> Result<UsageAnalytics> {
        let period_days = days.unwrap_or(DEFAULT_ANALYTICS_DAYS);
        if !(1..=MAX_HISTORY_DAYS).contains(&period_days) {
            return Err(EngineError::InvalidInput(format!(
                "analytics period must be 1 to {MAX_HISTORY_DAYS} days"
            )));
        }
        let current = self.current(user_id).await?;
        let today = self.ledger.today();
        let bad_day = || EngineError::InvalidInput(format!("bad day {today}"));
        let from_day = shift_day(&today, -period_days).ok_or_else(bad_day)?;
        let to_day = shift_day(&today, -1).ok_or_else(bad_day)?;
        let history = self
            .history(user_id, Some(&from_day), Some(&to_day))
            .await?;

        let daily_average =
            (history.total_messages as f64 / period_days as f64 * 100.0).round() / 100.0;
        let peak = history
            .days
            .iter()
            .filter(|d| d.messages_sent > 0)
            .fold(None::<&ArchivedDay>, |best, day| match best {
                Some(best) if best.messages_sent >= day.messages_sent => Some(best),
                _ => Some(day),
            });
        let trend = UsageTrend::of(&history.days);
        let likely_to_hit_limit = current
            .usage_percentage
            .is_some_and(|pct| pct > LIKELY_TO_HIT_PERCENT);
        let recommended_upgrade = trend == UsageTrend::Increasing
            && matches!(current.tier, Tier::Free | Tier::Basic);

        Ok(UsageAnalytics {
            period_days,
            total_messages: history.total_messages,
            total_tokens: history.total_tokens,
            daily_average,
            peak_day: peak.map(|d| d.day.clone()),
            peak_messages: peak.map_or(0, |d| d.messages_sent),
            trend,
            likely_to_hit_limit,
            recommended_upgrade,
            current,
        })
    }
}

fn valid_day(day: &str) -> Result<String> {
    let day = day.trim();
    parse_day(day)
        .map(|_| day.to_string())
        .ok_or_else(|| EngineError::InvalidInput(format!("expected YYYY-MM-DD, got {day}")))
}
