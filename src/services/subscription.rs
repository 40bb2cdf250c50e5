use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SECONDS_PER_DAY};
use crate::domains::subscription::{
    CancellationEvent, EventOutcome, PurchaseEvent, SubscriptionEventLog, SubscriptionRecord,
    SubscriptionStatus,
};
use crate::domains::tier::{Plan, Tier};
use crate::error::{EngineError, Result};
use crate::interfaces::stores::{CommitOutcome, SubscriptionStore};

const MAX_COMMIT_ATTEMPTS: usize = 5;
const SWEEP_BATCH: usize = 500;

/// Inputs to the subscription state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Purchase {
        tier: Tier,
        expires_at: Option<i64>,
        renewal: bool,
    },
    Cancel {
        refund: bool,
    },
    /// Scheduled check that moves an expired active subscription into grace.
    ExpirySweep,
    /// Scheduled check that ends a grace period.
    GraceSweep,
}

impl Trigger {
    fn name(&self) -> &'static str {
        match self {
            Trigger::Purchase { renewal: true, .. } => "renewal",
            Trigger::Purchase { .. } => "purchase",
            Trigger::Cancel { refund: true } => "refund",
            Trigger::Cancel { .. } => "cancel",
            Trigger::ExpirySweep => "expiry_sweep",
            Trigger::GraceSweep => "grace_sweep",
        }
    }
}

/// The closed transition table. Anything not listed is rejected.
///
/// | from           | trigger                 | to                         |
/// |----------------|-------------------------|----------------------------|
/// | none, expired  | purchase/renewal        | active                     |
/// | active         | purchase/renewal        | active (expiry moved)      |
/// | grace          | purchase/renewal        | active                     |
/// | active         | cancel                  | active, auto-renew off     |
/// | grace          | cancel                  | grace, auto-renew off      |
/// | active, grace  | refund                  | expired                    |
/// | active         | expiry sweep, now ≥ exp | grace                      |
/// | grace          | grace sweep, now ≥ end  | expired                    |
pub fn transition(
    current: &SubscriptionRecord,
    trigger: &Trigger,
    now: i64,
    grace_seconds: i64,
) -> Result<SubscriptionRecord> {
    use SubscriptionStatus as S;

    let rejected = || EngineError::InvalidTransition {
        from: current.status.to_string(),
        event: trigger.name().to_string(),
    };

    let mut next = current.clone();
    next.updated_at = now;
    match (current.status, trigger) {
        (
            _,
            Trigger::Purchase {
                tier,
                expires_at,
                renewal,
            },
        ) => {
            next.status = S::Active;
            next.tier = *tier;
            next.expires_at = match (current.status, renewal, current.expires_at, expires_at) {
                // A renewal never shortens an active subscription.
                (S::Active, true, Some(old), Some(new)) => Some(old.max(*new)),
                _ => *expires_at,
            };
            next.grace_until = None;
            next.auto_renew = *renewal || expires_at.is_some();
        }
        (S::Active | S::Grace, Trigger::Cancel { refund: false }) => {
            next.auto_renew = false;
        }
        (S::Active | S::Grace, Trigger::Cancel { refund: true }) => {
            next.status = S::Expired;
            next.grace_until = None;
            next.auto_renew = false;
        }
        (S::Active, Trigger::ExpirySweep) => {
            let expires_at = current
                .expires_at
                .filter(|at| *at <= now)
                .ok_or_else(rejected)?;
            next.status = S::Grace;
            // A late sweep still grants at least one observable grace tick.
            next.grace_until = Some((expires_at + grace_seconds).max(now + 1));
        }
        (S::Grace, Trigger::GraceSweep) => {
            current
                .grace_until
                .filter(|until| *until <= now)
                .ok_or_else(rejected)?;
            next.status = S::Expired;
            next.grace_until = None;
            next.auto_renew = false;
        }
        _ => return Err(rejected()),
    }
    Ok(next)
}

#[derive(Debug, Clone, Serialize)]
pub struct EventResult {
    pub outcome: EventOutcome,
    pub record: SubscriptionRecord,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub entered_grace: u64,
    pub expired: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.entered_grace + self.expired
    }
}

pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    grace_seconds: i64,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>, clock: Arc<dyn Clock>, grace_days: u32) -> Self {
        Self {
            store,
            clock,
            grace_seconds: grace_days as i64 * SECONDS_PER_DAY,
        }
    }

    pub fn grace_seconds(&self) -> i64 {
        self.grace_seconds
    }

    /// Current record, or the default free record for unknown users.
    pub async fn status(&self, user_id: &str) -> Result<SubscriptionRecord> {
        Ok(self
            .store
            .get(user_id)
            .await?
            .unwrap_or_else(|| SubscriptionRecord::default_for(user_id)))
    }

    pub async fn effective_tier(&self, user_id: &str) -> Result<Tier> {
        Ok(self.status(user_id).await?.effective_tier())
    }

    pub async fn events(&self, user_id: &str, limit: usize) -> Result<Vec<SubscriptionEventLog>> {
        self.store.events(user_id, limit).await
    }

    /// Applies a verified purchase. Replays of a known event id change nothing;
    /// events older than the last applied one are discarded.
    pub async fn apply_purchase(&self, event: &PurchaseEvent) -> Result<EventResult> {
        let plan = Plan::by_id(&event.tier.trim().to_ascii_lowercase());
        let tier = match event.tier.parse::<Tier>() {
            Ok(tier) => tier,
            Err(()) => {
                warn!(
                    user_id = %event.user_id,
                    event_id = %event.event_id,
                    tier = %event.tier,
                    "configuration anomaly: purchase names an unknown tier, rejecting"
                );
                self.log_outcome(purchase_log(event, None, EventOutcome::Rejected, self.clock.now()))
                    .await?;
                return Err(EngineError::ConfigurationAnomaly(format!(
                    "unknown tier or plan: {}",
                    event.tier
                )));
            }
        };
        let expires_at = event.expires_at.or_else(|| {
            plan.and_then(|plan| plan.duration_days)
                .map(|days| event.issued_at + days * SECONDS_PER_DAY)
        });
        let trigger = Trigger::Purchase {
            tier,
            expires_at,
            renewal: event.renewal,
        };
        let result = self
            .apply_event(&event.user_id, &event.event_id, event.issued_at, &trigger, |outcome, now| {
                purchase_log(event, expires_at, outcome, now)
            })
            .await?;
        if result.outcome == EventOutcome::Applied {
            info!(
                user_id = %event.user_id,
                event_id = %event.event_id,
                tier = %tier,
                ?expires_at,
                renewal = event.renewal,
                "subscription purchase applied"
            );
        }
        Ok(result)
    }

    pub async fn apply_cancellation(&self, event: &CancellationEvent) -> Result<EventResult> {
        let trigger = Trigger::Cancel {
            refund: event.refund,
        };
        let result = self
            .apply_event(&event.user_id, &event.event_id, event.issued_at, &trigger, |outcome, now| {
                SubscriptionEventLog {
                    event_id: event.event_id.clone(),
                    user_id: event.user_id.clone(),
                    kind: trigger.name().to_string(),
                    tier: None,
                    expires_at: None,
                    issued_at: event.issued_at,
                    outcome,
                    recorded_at: now,
                }
            })
            .await?;
        if result.outcome == EventOutcome::Applied {
            info!(
                user_id = %event.user_id,
                event_id = %event.event_id,
                refund = event.refund,
                status = %result.record.status,
                "subscription cancellation applied"
            );
        }
        Ok(result)
    }

    async fn apply_event<F>(
        &self,
        user_id: &str,
        event_id: &str,
        issued_at: i64,
        trigger: &Trigger,
        log: F,
    ) -> Result<EventResult>
    where
        F: Fn(EventOutcome, i64) -> SubscriptionEventLog,
    {
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let now = self.clock.now();
            let current = self.status(user_id).await?;

            if current.last_verified_event_id.as_deref() == Some(event_id)
                || self.store.find_event(event_id).await?.is_some()
            {
                debug!(user_id, event_id, "duplicate subscription event ignored");
                return Ok(EventResult {
                    outcome: EventOutcome::Duplicate,
                    record: current,
                });
            }

            if current.last_event_at.is_some_and(|last| issued_at < last) {
                warn!(
                    user_id,
                    event_id,
                    issued_at,
                    last_event_at = ?current.last_event_at,
                    "stale subscription event discarded"
                );
                self.log_outcome(log(EventOutcome::Stale, now)).await?;
                return Err(EngineError::SubscriptionConflict(format!(
                    "event {event_id} is older than the last applied event"
                )));
            }

            let mut next = match transition(&current, trigger, now, self.grace_seconds) {
                Ok(next) => next,
                Err(err) => {
                    warn!(user_id, event_id, error = %err, "subscription event rejected");
                    self.log_outcome(log(EventOutcome::Rejected, now)).await?;
                    return Err(err);
                }
            };
            next.last_verified_event_id = Some(event_id.to_string());
            next.last_event_at = Some(issued_at);

            let entry = log(EventOutcome::Applied, now);
            match self.store.commit(&next, current.version, Some(&entry)).await? {
                CommitOutcome::Committed => {
                    next.version = current.version + 1;
                    return Ok(EventResult {
                        outcome: EventOutcome::Applied,
                        record: next,
                    });
                }
                CommitOutcome::DuplicateEvent => {
                    return Ok(EventResult {
                        outcome: EventOutcome::Duplicate,
                        record: self.status(user_id).await?,
                    });
                }
                CommitOutcome::VersionConflict => {
                    debug!(user_id, event_id, "subscription changed concurrently, retrying");
                }
            }
        }
        Err(EngineError::unavailable("subscription update"))
    }

    async fn log_outcome(&self, entry: SubscriptionEventLog) -> Result<()> {
        self.store.log_event(&entry).await?;
        Ok(())
    }

    /// Applies a scheduled trigger to one record, re-reading it on concurrent
    /// modification. Returns false when the record is no longer due.
    async fn advance(&self, mut current: SubscriptionRecord, trigger: &Trigger) -> Result<bool> {
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let now = self.clock.now();
            let next = match transition(&current, trigger, now, self.grace_seconds) {
                Ok(next) => next,
                Err(EngineError::InvalidTransition { .. }) => return Ok(false),
                Err(err) => return Err(err),
            };
            match self.store.commit(&next, current.version, None).await? {
                CommitOutcome::Committed => {
                    info!(
                        user_id = %next.user_id,
                        from = %current.status,
                        to = %next.status,
                        grace_until = ?next.grace_until,
                        "subscription transitioned"
                    );
                    return Ok(true);
                }
                CommitOutcome::VersionConflict | CommitOutcome::DuplicateEvent => {
                    match self.store.get(&current.user_id).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(false),
                    }
                }
            }
        }
        Err(EngineError::unavailable("subscription sweep"))
    }

    /// One sweep: expired active records enter grace, then ended grace
    /// periods expire. A record that enters grace here is never expired in
    /// the same sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        loop {
            let due = self.store.due_for_grace(now, SWEEP_BATCH).await?;
            let batch_len = due.len();
            let mut moved = 0;
            for record in due {
                if self.advance(record, &Trigger::ExpirySweep).await? {
                    moved += 1;
                }
            }
            report.entered_grace += moved;
            if batch_len < SWEEP_BATCH || moved == 0 {
                break;
            }
        }

        loop {
            let due = self.store.due_for_expiry(now, SWEEP_BATCH).await?;
            let batch_len = due.len();
            let mut moved = 0;
            for record in due {
                if self.advance(record, &Trigger::GraceSweep).await? {
                    moved += 1;
                }
            }
            report.expired += moved;
            if batch_len < SWEEP_BATCH || moved == 0 {
                break;
            }
        }

        Ok(report)
    }
}

fn purchase_log(
    event: &PurchaseEvent,
    expires_at: Option<i64>,
    outcome: EventOutcome,
    now: i64,
) -> SubscriptionEventLog {
    SubscriptionEventLog {
        event_id: event.event_id.clone(),
        user_id: event.user_id.clone(),
        kind: if event.renewal { "renewal" } else { "purchase" }.to_string(),
        tier: Some(event.tier.clone()),
        expires_at: expires_at.or(event.expires_at),
        issued_at: event.issued_at,
        outcome,
        recorded_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;
    const GRACE: i64 = 3 * SECONDS_PER_DAY;

    fn active(tier: Tier, expires_at: Option<i64>) -> SubscriptionRecord {
        SubscriptionRecord {
            tier,
            status: SubscriptionStatus::Active,
            expires_at,
            ..SubscriptionRecord::default_for("u1")
        }
    }

    #[test]
    fn purchase_activates_from_none_and_expired() {
        let trigger = Trigger::Purchase {
            tier: Tier::Premium,
            expires_at: Some(NOW + 100),
            renewal: false,
        };
        for status in [SubscriptionStatus::None, SubscriptionStatus::Expired] {
            let record = SubscriptionRecord {
                status,
                ..SubscriptionRecord::default_for("u1")
            };
            let next = transition(&record, &trigger, NOW, GRACE).unwrap();
            assert_eq!(next.status, SubscriptionStatus::Active);
            assert_eq!(next.effective_tier(), Tier::Premium);
            assert_eq!(next.expires_at, Some(NOW + 100));
        }
    }

    #[test]
    fn renewal_never_shortens_expiry() {
        let record = active(Tier::Premium, Some(NOW + 1_000));
        let trigger = Trigger::Purchase {
            tier: Tier::Premium,
            expires_at: Some(NOW + 500),
            renewal: true,
        };
        let next = transition(&record, &trigger, NOW, GRACE).unwrap();
        assert_eq!(next.expires_at, Some(NOW + 1_000));
    }

    #[test]
    fn expiry_sweep_requires_passed_expiry() {
        let record = active(Tier::Premium, Some(NOW + 10));
        assert!(matches!(
            transition(&record, &Trigger::ExpirySweep, NOW, GRACE),
            Err(EngineError::InvalidTransition { .. })
        ));

        let lifetime = active(Tier::Pro, None);
        assert!(transition(&lifetime, &Trigger::ExpirySweep, NOW, GRACE).is_err());

        let record = active(Tier::Premium, Some(NOW - 3_600));
        let next = transition(&record, &Trigger::ExpirySweep, NOW, GRACE).unwrap();
        assert_eq!(next.status, SubscriptionStatus::Grace);
        assert_eq!(next.grace_until, Some(NOW - 3_600 + GRACE));
        assert_eq!(next.effective_tier(), Tier::Premium);
    }

    #[test]
    fn late_sweep_still_lands_in_grace() {
        let record = active(Tier::Premium, Some(NOW - 10 * SECONDS_PER_DAY));
        let next = transition(&record, &Trigger::ExpirySweep, NOW, GRACE).unwrap();
        assert_eq!(next.status, SubscriptionStatus::Grace);
        assert!(next.grace_until.unwrap() > NOW);
        assert!(next.grace_until.unwrap() > record.expires_at.unwrap());
    }

    #[test]
    fn grace_sweep_expires_only_after_grace_end() {
        let mut record = active(Tier::Premium, Some(NOW - 100));
        record.status = SubscriptionStatus::Grace;
        record.grace_until = Some(NOW + 100);
        assert!(transition(&record, &Trigger::GraceSweep, NOW, GRACE).is_err());

        let next = transition(&record, &Trigger::GraceSweep, NOW + 100, GRACE).unwrap();
        assert_eq!(next.status, SubscriptionStatus::Expired);
        assert_eq!(next.effective_tier(), Tier::Free);
        assert_eq!(next.grace_until, None);
    }

    #[test]
    fn cancellation_paths() {
        let record = active(Tier::Premium, Some(NOW + 100));
        let kept = transition(&record, &Trigger::Cancel { refund: false }, NOW, GRACE).unwrap();
        assert_eq!(kept.status, SubscriptionStatus::Active);
        assert!(!kept.auto_renew);

        let refunded = transition(&record, &Trigger::Cancel { refund: true }, NOW, GRACE).unwrap();
        assert_eq!(refunded.status, SubscriptionStatus::Expired);

        let none = SubscriptionRecord::default_for("u1");
        assert!(matches!(
            transition(&none, &Trigger::Cancel { refund: true }, NOW, GRACE),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn sweeps_never_apply_to_inactive_records() {
        let none = SubscriptionRecord::default_for("u1");
        assert!(transition(&none, &Trigger::ExpirySweep, NOW, GRACE).is_err());
        assert!(transition(&none, &Trigger::GraceSweep, NOW, GRACE).is_err());
    }
}
