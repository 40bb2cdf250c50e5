use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{calendar_day, Clock};
use crate::domains::usage::{
    ArchivedDay, CheckOutcome, CounterKind, ReconcileOutcome, Reservation, UsageCounter,
};
use crate::error::Result;
use crate::interfaces::stores::UsageStore;

pub const DEFAULT_RECONCILE_TOLERANCE: u64 = 256;

/// Per-user usage counters with atomic check-and-increment. All mutation of
/// counters goes through here.
pub struct QuotaLedger {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    day_offset_hours: i32,
    tolerance: u64,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            day_offset_hours: 0,
            tolerance: DEFAULT_RECONCILE_TOLERANCE,
        }
    }

    pub fn with_day_offset(mut self, hours: i32) -> Self {
        self.day_offset_hours = hours;
        self
    }

    pub fn with_tolerance(mut self, tokens: u64) -> Self {
        self.tolerance = tokens;
        self
    }

    pub fn today(&self) -> String {
        calendar_day(self.clock.now(), self.day_offset_hours)
    }

    pub fn day_of(&self, ts: i64) -> String {
        calendar_day(ts, self.day_offset_hours)
    }

    /// Unlimited (`limit == None`) always allows and still counts.
    pub async fn check_and_increment(
        &self,
        user_id: &str,
        kind: CounterKind,
        amount: u64,
        limit: Option<u64>,
    ) -> Result<CheckOutcome> {
        let day = self.today();
        let outcome = self
            .store
            .check_and_increment(user_id, &day, kind, amount, limit, self.clock.now())
            .await?;
        if !outcome.allowed {
            debug!(user_id, counter = %kind, value = outcome.new_value, ?limit, "quota check denied");
        }
        Ok(outcome)
    }

    /// Provisionally charges `amount` tokens. `None` when the charge would
    /// cross the daily token ceiling.
    pub async fn reserve(
        &self,
        user_id: &str,
        amount: u64,
        limit: Option<u64>,
    ) -> Result<Option<Reservation>> {
        let mut reservation = Reservation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            amount,
            day: self.today(),
        };
        let outcome = self
            .store
            .reserve_tokens(&reservation, limit, self.clock.now())
            .await?;
        if !outcome.allowed {
            debug!(user_id, tokens_today = outcome.new_value, ?limit, "token reservation denied");
            return Ok(None);
        }
        // Before the daily reset runs the charge lands on the previous
        // day's row, and reconcile has to find that row again.
        reservation.day = outcome.day;
        Ok(Some(reservation))
    }

    /// Replaces a reservation's provisional charge with the real cost. Applying
    /// the same reservation twice changes nothing the second time.
    pub async fn reconcile(&self, reservation: &Reservation, actual: u64) -> Result<ReconcileOutcome> {
        if actual > reservation.amount.saturating_add(self.tolerance) {
            warn!(
                user_id = %reservation.user_id,
                reservation_id = %reservation.id,
                reserved = reservation.amount,
                actual,
                "token usage exceeded reservation beyond tolerance"
            );
        }
        let outcome = self
            .store
            .reconcile(reservation, actual, self.clock.now())
            .await?;
        match outcome {
            ReconcileOutcome::Applied { tokens_today } => debug!(
                user_id = %reservation.user_id,
                reservation_id = %reservation.id,
                reserved = reservation.amount,
                actual,
                tokens_today,
                "reservation reconciled"
            ),
            ReconcileOutcome::AlreadyApplied => debug!(
                reservation_id = %reservation.id,
                "reservation already reconciled"
            ),
            ReconcileOutcome::DayClosed => debug!(
                reservation_id = %reservation.id,
                day = %reservation.day,
                "reservation reconciled against archived day"
            ),
        }
        Ok(outcome)
    }

    /// Gives back running-total usage (a deleted persona or file).
    pub async fn release(&self, user_id: &str, kind: CounterKind, amount: u64) -> Result<u64> {
        self.store
            .release(user_id, kind, amount, self.clock.now())
            .await
    }

    /// Zeroes one day-scoped counter. Scheduler and operator use only.
    pub async fn reset(&self, user_id: &str, kind: CounterKind) -> Result<bool> {
        self.store
            .reset_counter(user_id, kind, self.clock.now())
            .await
    }

    /// Archives and zeroes every counter row still on a day before `day`.
    pub async fn reset_day(&self, day: &str) -> Result<u64> {
        self.store.reset_day(day, self.clock.now()).await
    }

    /// Unlocked, eventually-consistent read for display.
    pub async fn snapshot(&self, user_id: &str) -> Result<UsageCounter> {
        Ok(self
            .store
            .counters(user_id)
            .await?
            .unwrap_or_else(|| UsageCounter::empty(user_id, &self.today())))
    }

    pub async fn archived(&self, user_id: &str, from_day: &str, to_day: &str) -> Result<Vec<ArchivedDay>> {
        self.store.archived_days(user_id, from_day, to_day).await
    }
}
