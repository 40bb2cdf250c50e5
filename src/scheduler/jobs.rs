use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::{Clock, SECONDS_PER_DAY};
use crate::error::{EngineError, Result};
use crate::interfaces::scheduler::{JobTick, ScheduledJob};
use crate::interfaces::stores::{ConversationStore, JobRunStore};
use crate::services::ledger::QuotaLedger;
use crate::services::subscription::SubscriptionService;
use crate::services::tier_policy::TierPolicy;

pub const DAILY_RESET: &str = "daily_reset";
pub const GRACE_SWEEP: &str = "grace_sweep";
pub const RETENTION_CLEANUP: &str = "retention_cleanup";

pub const DEFAULT_LEASE_SECONDS: i64 = 900;

/// Claims a `(job, slot)` run record around a unit of work. A failed run is
/// recorded as failed so the next tick claims the slot again.
#[derive(Clone)]
pub struct JobRunner {
    runs: Arc<dyn JobRunStore>,
    clock: Arc<dyn Clock>,
    lease_seconds: i64,
}

impl JobRunner {
    pub fn new(runs: Arc<dyn JobRunStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            runs,
            clock,
            lease_seconds: DEFAULT_LEASE_SECONDS,
        }
    }

    pub fn with_lease_seconds(mut self, seconds: i64) -> Self {
        self.lease_seconds = seconds.max(1);
        self
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub async fn run_slot<F>(&self, job: &str, slot: String, work: F) -> Result<JobTick>
    where
        F: Future<Output = Result<u64>> + Send,
    {
        if !self
            .runs
            .try_claim(job, &slot, self.clock.now(), self.lease_seconds)
            .await?
        {
            return Ok(JobTick::Skipped { slot });
        }

        match work.await {
            Ok(affected_rows) => {
                self.runs
                    .complete(job, &slot, affected_rows, self.clock.now())
                    .await?;
                Ok(JobTick::Ran {
                    slot,
                    affected_rows,
                })
            }
            Err(err) => {
                let reason = err.to_string();
                if let Err(record_err) = self
                    .runs
                    .fail(job, &slot, &reason, self.clock.now())
                    .await
                {
                    warn!(job, slot = %slot, error = %record_err, "failed to record job failure");
                }
                Err(EngineError::JobFailed {
                    job: job.to_string(),
                    reason,
                })
            }
        }
    }
}

/// Archives and zeroes yesterday's day-scoped counters, once per calendar
/// day in the reference timezone.
pub struct DailyResetJob {
    runner: JobRunner,
    ledger: Arc<QuotaLedger>,
    interval: Duration,
}

impl DailyResetJob {
    pub fn new(runner: JobRunner, ledger: Arc<QuotaLedger>, interval: Duration) -> Self {
        Self {
            runner,
            ledger,
            interval,
        }
    }
}

#[async_trait]
impl ScheduledJob for DailyResetJob {
    fn name(&self) -> &str {
        DAILY_RESET
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobTick> {
        let today = self.ledger.today();
        self.runner
            .run_slot(DAILY_RESET, today.clone(), async {
                let reset = self.ledger.reset_day(&today).await?;
                info!(day = %today, users = reset, "daily counters reset");
                Ok::<_, EngineError>(reset)
            })
            .await
    }
}

/// Moves lapsed subscriptions into grace and ended grace periods to expired.
pub struct GraceSweepJob {
    runner: JobRunner,
    subscriptions: Arc<SubscriptionService>,
    interval: Duration,
}

impl GraceSweepJob {
    pub fn new(
        runner: JobRunner,
        subscriptions: Arc<SubscriptionService>,
        interval: Duration,
    ) -> Self {
        Self {
            runner,
            subscriptions,
            interval,
        }
    }
}

#[async_trait]
impl ScheduledJob for GraceSweepJob {
    fn name(&self) -> &str {
        GRACE_SWEEP
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobTick> {
        let bucket = self.interval.as_secs().max(1) as i64;
        let slot = (self.runner.now().div_euclid(bucket) * bucket).to_string();
        self.runner
            .run_slot(GRACE_SWEEP, slot, async {
                let report = self.subscriptions.sweep().await?;
                if report.total() > 0 {
                    info!(
                        entered_grace = report.entered_grace,
                        expired = report.expired,
                        "subscription sweep moved records"
                    );
                }
                Ok::<_, EngineError>(report.total())
            })
            .await
    }
}

/// Deletes chat history older than each user's current retention window.
pub struct RetentionCleanupJob {
    runner: JobRunner,
    ledger: Arc<QuotaLedger>,
    subscriptions: Arc<SubscriptionService>,
    policy: Arc<TierPolicy>,
    conversations: Arc<dyn ConversationStore>,
    interval: Duration,
}

impl RetentionCleanupJob {
    pub fn new(
        runner: JobRunner,
        ledger: Arc<QuotaLedger>,
        subscriptions: Arc<SubscriptionService>,
        policy: Arc<TierPolicy>,
        conversations: Arc<dyn ConversationStore>,
        interval: Duration,
    ) -> Self {
        Self {
            runner,
            ledger,
            subscriptions,
            policy,
            conversations,
            interval,
        }
    }

    async fn cleanup(&self, now: i64) -> Result<u64> {
        let mut deleted = 0;
        for user_id in self.conversations.users_with_history().await? {
            let tier = self.subscriptions.effective_tier(&user_id).await?;
            let Some(days) = self.policy.effective_limits(tier).history_retention_days else {
                continue;
            };
            let cutoff = now - i64::from(days) * SECONDS_PER_DAY;
            let removed = self.conversations.delete_older_than(&user_id, cutoff).await?;
            if removed > 0 {
                info!(user_id = %user_id, tier = %tier, removed, "expired chat history deleted");
            }
            deleted += removed;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl ScheduledJob for RetentionCleanupJob {
    fn name(&self) -> &str {
        RETENTION_CLEANUP
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobTick> {
        let now = self.runner.now();
        let slot = self.ledger.day_of(now);
        self.runner
            .run_slot(RETENTION_CLEANUP, slot, self.cleanup(now))
            .await
    }
}
