use async_trait::async_trait;

use crate::domains::chat::{ChatRole, HistoryTurn};
use crate::domains::job::JobRun;
use crate::domains::subscription::{SubscriptionEventLog, SubscriptionRecord};
use crate::domains::usage::{
    ArchivedDay, CheckOutcome, CounterKind, ReconcileOutcome, Reservation, ReserveOutcome,
    UsageCounter,
};
use crate::error::Result;

/// Durable per-user counters. Every mutating call is atomic per user: no
/// caller can observe or interleave with a half-applied update.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Adds `amount` to `kind` when the result stays within `limit` (`None`
    /// is unlimited); otherwise leaves the counter unchanged. A user without
    /// a counter row starts at zero on `day`.
    async fn check_and_increment(
        &self,
        user_id: &str,
        day: &str,
        kind: CounterKind,
        amount: u64,
        limit: Option<u64>,
        now: i64,
    ) -> Result<CheckOutcome>;

    /// Check-and-increment of the token counter that also records the
    /// reservation, in one step. No reservation is recorded on denial.
    /// `reservation.day` only seeds a missing row; the reservation is
    /// recorded against the day of the row actually charged.
    async fn reserve_tokens(
        &self,
        reservation: &Reservation,
        limit: Option<u64>,
        now: i64,
    ) -> Result<ReserveOutcome>;

    /// Replaces the reserved amount with `actual`, at most once per
    /// reservation id. Clamps at zero.
    async fn reconcile(
        &self,
        reservation: &Reservation,
        actual: u64,
        now: i64,
    ) -> Result<ReconcileOutcome>;

    /// Decrements a running-total counter, clamping at zero. Returns the new
    /// value.
    async fn release(&self, user_id: &str, kind: CounterKind, amount: u64, now: i64)
        -> Result<u64>;

    /// Zeroes one day-scoped counter of one user. Returns false when the user
    /// has no counters.
    async fn reset_counter(&self, user_id: &str, kind: CounterKind, now: i64) -> Result<bool>;

    /// Archives and zeroes the day-scoped counters of every row whose day is
    /// before `day`, moving those rows to `day`. Returns the number of rows
    /// reset. Rows already on `day` are untouched, so reapplying is a no-op.
    async fn reset_day(&self, day: &str, now: i64) -> Result<u64>;

    async fn counters(&self, user_id: &str) -> Result<Option<UsageCounter>>;

    /// Archived days in `[from_day, to_day]`, oldest first.
    async fn archived_days(
        &self,
        user_id: &str,
        from_day: &str,
        to_day: &str,
    ) -> Result<Vec<ArchivedDay>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The stored version moved since the record was read.
    VersionConflict,
    /// The attached event id was already recorded.
    DuplicateEvent,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionRecord>>;

    /// Stores `record` with version `expected_version + 1` if the stored
    /// version still equals `expected_version` (0 means "no row yet"), and
    /// records `event` in the same step.
    async fn commit(
        &self,
        record: &SubscriptionRecord,
        expected_version: i64,
        event: Option<&SubscriptionEventLog>,
    ) -> Result<CommitOutcome>;

    /// Records an event that did not change state. Returns false when the id
    /// was already recorded.
    async fn log_event(&self, entry: &SubscriptionEventLog) -> Result<bool>;

    async fn find_event(&self, event_id: &str) -> Result<Option<SubscriptionEventLog>>;

    /// Newest first.
    async fn events(&self, user_id: &str, limit: usize) -> Result<Vec<SubscriptionEventLog>>;

    /// Active records with `expires_at <= now`.
    async fn due_for_grace(&self, now: i64, limit: usize) -> Result<Vec<SubscriptionRecord>>;

    /// Grace records with `grace_until <= now`.
    async fn due_for_expiry(&self, now: i64, limit: usize) -> Result<Vec<SubscriptionRecord>>;
}

#[async_trait]
pub trait JobRunStore: Send + Sync {
    /// Claims `(job_name, slot)` for this process. Succeeds when the slot has
    /// never run, last failed, or its running claim is older than
    /// `lease_seconds`. Completed slots are never claimed again.
    async fn try_claim(
        &self,
        job_name: &str,
        slot: &str,
        now: i64,
        lease_seconds: i64,
    ) -> Result<bool>;

    async fn complete(&self, job_name: &str, slot: &str, affected_rows: u64, now: i64)
        -> Result<()>;

    async fn fail(&self, job_name: &str, slot: &str, error: &str, now: i64) -> Result<()>;

    async fn get(&self, job_name: &str, slot: &str) -> Result<Option<JobRun>>;

    /// Newest first.
    async fn runs(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(
        &self,
        user_id: &str,
        persona_id: &str,
        role: ChatRole,
        content: &str,
        created_at: i64,
    ) -> Result<()>;

    /// The newest `limit` turns, returned in chronological order.
    async fn recent(&self, user_id: &str, persona_id: &str, limit: usize)
        -> Result<Vec<HistoryTurn>>;

    async fn users_with_history(&self) -> Result<Vec<String>>;

    /// Deletes the user's turns created before `cutoff`. Returns the count.
    async fn delete_older_than(&self, user_id: &str, cutoff: i64) -> Result<u64>;
}
