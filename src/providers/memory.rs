use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::domains::chat::{ChatRole, HistoryTurn};
use crate::domains::job::{JobRun, JobStatus};
use crate::domains::subscription::{SubscriptionEventLog, SubscriptionRecord, SubscriptionStatus};
use crate::domains::usage::{
    ArchivedDay, CheckOutcome, CounterKind, ReconcileOutcome, Reservation, ReserveOutcome,
    UsageCounter,
};
use crate::error::{EngineError, Result};
use crate::interfaces::stores::{
    CommitOutcome, ConversationStore, JobRunStore, SubscriptionStore, UsageStore,
};

#[derive(Default)]
struct UserLedger {
    counter: Option<UsageCounter>,
    reservations: HashMap<String, (Reservation, Option<u64>)>,
    archive: BTreeMap<String, ArchivedDay>,
}

#[derive(Default)]
struct SubscriptionState {
    records: HashMap<String, SubscriptionRecord>,
    events: HashMap<String, SubscriptionEventLog>,
}

#[derive(Clone)]
struct StoredTurn {
    persona_id: String,
    turn: HistoryTurn,
}

/// Non-durable implementation of every store trait. Each user's counters sit
/// behind their own lock, so check-and-increment is linearizable per user.
///
/// Per-user ledgers, settled reservation ids and archived days are never
/// evicted; memory grows with the number of distinct users. Meant for tests
/// and embedders with a bounded user set. Use `SqliteStore` otherwise.
#[derive(Default)]
pub struct InMemoryStore {
    ledgers: RwLock<HashMap<String, Arc<Mutex<UserLedger>>>>,
    subscriptions: Mutex<SubscriptionState>,
    jobs: Mutex<BTreeMap<(String, String), JobRun>>,
    conversations: RwLock<HashMap<String, Vec<StoredTurn>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ledger(&self, user_id: &str) -> Arc<Mutex<UserLedger>> {
        if let Some(ledger) = self.ledgers.read().await.get(user_id) {
            return ledger.clone();
        }
        self.ledgers
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    async fn existing_ledger(&self, user_id: &str) -> Option<Arc<Mutex<UserLedger>>> {
        self.ledgers.read().await.get(user_id).cloned()
    }
}

fn increment(
    ledger: &mut UserLedger,
    user_id: &str,
    day: &str,
    kind: CounterKind,
    amount: u64,
    limit: Option<u64>,
) -> CheckOutcome {
    let counter = ledger
        .counter
        .get_or_insert_with(|| UsageCounter::empty(user_id, day));
    let current = counter.value(kind);
    let next = current.saturating_add(amount);
    let allowed = limit.map_or(true, |limit| next <= limit);
    if allowed {
        *counter.value_mut(kind) = next;
    }
    CheckOutcome {
        allowed,
        new_value: counter.value(kind),
    }
}

fn adjust(value: u64, reserved: u64, actual: u64) -> u64 {
    value.saturating_sub(reserved).saturating_add(actual)
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn check_and_increment(
        &self,
        user_id: &str,
        day: &str,
        kind: CounterKind,
        amount: u64,
        limit: Option<u64>,
        _now: i64,
    ) -> Result<CheckOutcome> {
        let ledger = self.ledger(user_id).await;
        let mut ledger = ledger.lock().await;
        Ok(increment(&mut ledger, user_id, day, kind, amount, limit))
    }

    async fn reserve_tokens(
        &self,
        reservation: &Reservation,
        limit: Option<u64>,
        _now: i64,
    ) -> Result<ReserveOutcome> {
        let ledger = self.ledger(&reservation.user_id).await;
        let mut ledger = ledger.lock().await;
        if ledger.reservations.contains_key(&reservation.id) {
            return Err(EngineError::InvalidInput(format!(
                "reservation {} already exists",
                reservation.id
            )));
        }
        let outcome = increment(
            &mut ledger,
            &reservation.user_id,
            &reservation.day,
            CounterKind::Tokens,
            reservation.amount,
            limit,
        );
        let day = ledger
            .counter
            .as_ref()
            .map_or_else(|| reservation.day.clone(), |c| c.day.clone());
        if outcome.allowed {
            let charged = Reservation {
                day: day.clone(),
                ..reservation.clone()
            };
            ledger
                .reservations
                .insert(reservation.id.clone(), (charged, None));
        }
        Ok(ReserveOutcome {
            allowed: outcome.allowed,
            new_value: outcome.new_value,
            day,
        })
    }

    async fn reconcile(
        &self,
        reservation: &Reservation,
        actual: u64,
        _now: i64,
    ) -> Result<ReconcileOutcome> {
        let not_found = || EngineError::NotFound(format!("reservation {}", reservation.id));
        let ledger = self
            .existing_ledger(&reservation.user_id)
            .await
            .ok_or_else(not_found)?;
        let mut ledger = ledger.lock().await;
        let ledger = &mut *ledger;

        let (stored, applied) = ledger
            .reservations
            .get_mut(&reservation.id)
            .ok_or_else(not_found)?;
        if applied.is_some() {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }
        *applied = Some(actual);
        let (reserved, day) = (stored.amount, stored.day.clone());

        if let Some(counter) = ledger.counter.as_mut().filter(|c| c.day == day) {
            counter.tokens_consumed = adjust(counter.tokens_consumed, reserved, actual);
            return Ok(ReconcileOutcome::Applied {
                tokens_today: counter.tokens_consumed,
            });
        }
        if let Some(archived) = ledger.archive.get_mut(&day) {
            archived.tokens_consumed = adjust(archived.tokens_consumed, reserved, actual);
        }
        Ok(ReconcileOutcome::DayClosed)
    }

    async fn release(
        &self,
        user_id: &str,
        kind: CounterKind,
        amount: u64,
        _now: i64,
    ) -> Result<u64> {
        if kind.is_day_scoped() {
            return Err(EngineError::InvalidInput(format!(
                "{kind} is day-scoped and cannot be released"
            )));
        }
        let Some(ledger) = self.existing_ledger(user_id).await else {
            return Ok(0);
        };
        let mut ledger = ledger.lock().await;
        Ok(match ledger.counter.as_mut() {
            Some(counter) => {
                let value = counter.value_mut(kind);
                *value = value.saturating_sub(amount);
                *value
            }
            None => 0,
        })
    }

    async fn reset_counter(&self, user_id: &str, kind: CounterKind, now: i64) -> Result<bool> {
        if !kind.is_day_scoped() {
            return Err(EngineError::InvalidInput(format!(
                "{kind} is a running total and is never reset"
            )));
        }
        let Some(ledger) = self.existing_ledger(user_id).await else {
            return Ok(false);
        };
        let mut ledger = ledger.lock().await;
        Ok(match ledger.counter.as_mut() {
            Some(counter) => {
                *counter.value_mut(kind) = 0;
                counter.reset_at = Some(now);
                true
            }
            None => false,
        })
    }

    async fn reset_day(&self, day: &str, now: i64) -> Result<u64> {
        let ledgers: Vec<Arc<Mutex<UserLedger>>> =
            self.ledgers.read().await.values().cloned().collect();
        let mut reset = 0;
        for ledger in ledgers {
            let mut ledger = ledger.lock().await;
            let ledger = &mut *ledger;
            let Some(counter) = ledger.counter.as_mut() else {
                continue;
            };
            if counter.day.as_str() >= day {
                continue;
            }
            ledger.archive.insert(
                counter.day.clone(),
                ArchivedDay {
                    user_id: counter.user_id.clone(),
                    day: counter.day.clone(),
                    messages_sent: counter.messages_sent,
                    tokens_consumed: counter.tokens_consumed,
                    archived_at: now,
                },
            );
            counter.messages_sent = 0;
            counter.tokens_consumed = 0;
            counter.day = day.to_string();
            counter.reset_at = Some(now);
            ledger
                .reservations
                .retain(|_, (reservation, applied)| {
                    applied.is_none() || reservation.day.as_str() >= day
                });
            reset += 1;
        }
        Ok(reset)
    }

    async fn counters(&self, user_id: &str) -> Result<Option<UsageCounter>> {
        let Some(ledger) = self.existing_ledger(user_id).await else {
            return Ok(None);
        };
        let ledger = ledger.lock().await;
        Ok(ledger.counter.clone())
    }

    async fn archived_days(
        &self,
        user_id: &str,
        from_day: &str,
        to_day: &str,
    ) -> Result<Vec<ArchivedDay>> {
        let Some(ledger) = self.existing_ledger(user_id).await else {
            return Ok(Vec::new());
        };
        let ledger = ledger.lock().await;
        Ok(ledger
            .archive
            .range(from_day.to_string()..=to_day.to_string())
            .map(|(_, day)| day.clone())
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionRecord>> {
        Ok(self.subscriptions.lock().await.records.get(user_id).cloned())
    }

    async fn commit(
        &self,
        record: &SubscriptionRecord,
        expected_version: i64,
        event: Option<&SubscriptionEventLog>,
    ) -> Result<CommitOutcome> {
        let mut state = self.subscriptions.lock().await;
        if let Some(event) = event {
            if state.events.contains_key(&event.event_id) {
                return Ok(CommitOutcome::DuplicateEvent);
            }
        }
        let stored_version = state
            .records
            .get(&record.user_id)
            .map(|r| r.version)
            .unwrap_or(0);
        if stored_version != expected_version {
            return Ok(CommitOutcome::VersionConflict);
        }
        let mut next = record.clone();
        next.version = expected_version + 1;
        state.records.insert(next.user_id.clone(), next);
        if let Some(event) = event {
            state.events.insert(event.event_id.clone(), event.clone());
        }
        Ok(CommitOutcome::Committed)
    }

    async fn log_event(&self, entry: &SubscriptionEventLog) -> Result<bool> {
        let mut state = self.subscriptions.lock().await;
        if state.events.contains_key(&entry.event_id) {
            return Ok(false);
        }
        state.events.insert(entry.event_id.clone(), entry.clone());
        Ok(true)
    }

    async fn find_event(&self, event_id: &str) -> Result<Option<SubscriptionEventLog>> {
        Ok(self.subscriptions.lock().await.events.get(event_id).cloned())
    }

    async fn events(&self, user_id: &str, limit: usize) -> Result<Vec<SubscriptionEventLog>> {
        let state = self.subscriptions.lock().await;
        let mut events: Vec<SubscriptionEventLog> = state
            .events
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            b.recorded_at
                .cmp(&a.recorded_at)
                .then(b.issued_at.cmp(&a.issued_at))
        });
        if limit > 0 {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn due_for_grace(&self, now: i64, limit: usize) -> Result<Vec<SubscriptionRecord>> {
        let state = self.subscriptions.lock().await;
        let mut due: Vec<SubscriptionRecord> = state
            .records
            .values()
            .filter(|r| r.status == SubscriptionStatus::Active)
            .filter(|r| r.expires_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.expires_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn due_for_expiry(&self, now: i64, limit: usize) -> Result<Vec<SubscriptionRecord>> {
        let state = self.subscriptions.lock().await;
        let mut due: Vec<SubscriptionRecord> = state
            .records
            .values()
            .filter(|r| r.status == SubscriptionStatus::Grace)
            .filter(|r| r.grace_until.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.grace_until);
        due.truncate(limit);
        Ok(due)
    }
}

#[async_trait]
impl JobRunStore for InMemoryStore {
    async fn try_claim(
        &self,
        job_name: &str,
        slot: &str,
        now: i64,
        lease_seconds: i64,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let key = (job_name.to_string(), slot.to_string());
        match jobs.get_mut(&key) {
            None => {
                jobs.insert(
                    key,
                    JobRun {
                        job_name: job_name.to_string(),
                        scheduled_for: slot.to_string(),
                        status: JobStatus::Running,
                        affected_rows: 0,
                        attempts: 1,
                        started_at: now,
                        finished_at: None,
                        error: None,
                    },
                );
                Ok(true)
            }
            Some(run) => {
                let claimable = match run.status {
                    JobStatus::Completed => false,
                    JobStatus::Running => run.started_at + lease_seconds <= now,
                    JobStatus::Pending | JobStatus::Failed => true,
                };
                if claimable {
                    run.status = JobStatus::Running;
                    run.attempts += 1;
                    run.started_at = now;
                    run.finished_at = None;
                    run.error = None;
                }
                Ok(claimable)
            }
        }
    }

    async fn complete(
        &self,
        job_name: &str,
        slot: &str,
        affected_rows: u64,
        now: i64,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(run) = jobs.get_mut(&(job_name.to_string(), slot.to_string())) {
            run.status = JobStatus::Completed;
            run.affected_rows = affected_rows;
            run.finished_at = Some(now);
            run.error = None;
        }
        Ok(())
    }

    async fn fail(&self, job_name: &str, slot: &str, error: &str, now: i64) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(run) = jobs.get_mut(&(job_name.to_string(), slot.to_string())) {
            run.status = JobStatus::Failed;
            run.finished_at = Some(now);
            run.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get(&self, job_name: &str, slot: &str) -> Result<Option<JobRun>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .get(&(job_name.to_string(), slot.to_string()))
            .cloned())
    }

    async fn runs(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>> {
        let jobs = self.jobs.lock().await;
        let mut runs: Vec<JobRun> = jobs
            .values()
            .filter(|run| run.job_name == job_name)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit.max(1));
        Ok(runs)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn append(
        &self,
        user_id: &str,
        persona_id: &str,
        role: ChatRole,
        content: &str,
        created_at: i64,
    ) -> Result<()> {
        let mut guard = self.conversations.write().await;
        guard.entry(user_id.to_string()).or_default().push(StoredTurn {
            persona_id: persona_id.to_string(),
            turn: HistoryTurn {
                role,
                content: content.to_string(),
                created_at,
            },
        });
        Ok(())
    }

    async fn recent(
        &self,
        user_id: &str,
        persona_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryTurn>> {
        let guard = self.conversations.read().await;
        let mut turns: Vec<HistoryTurn> = guard
            .get(user_id)
            .map(|turns| {
                turns
                    .iter()
                    .filter(|stored| stored.persona_id == persona_id)
                    .map(|stored| stored.turn.clone())
                    .collect()
            })
            .unwrap_or_default();
        turns.sort_by_key(|turn| turn.created_at);
        if limit > 0 && turns.len() > limit {
            turns = turns.split_off(turns.len() - limit);
        }
        Ok(turns)
    }

    async fn users_with_history(&self) -> Result<Vec<String>> {
        let guard = self.conversations.read().await;
        let mut users: Vec<String> = guard
            .iter()
            .filter(|(_, turns)| !turns.is_empty())
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        Ok(users)
    }

    async fn delete_older_than(&self, user_id: &str, cutoff: i64) -> Result<u64> {
        let mut guard = self.conversations.write().await;
        let Some(turns) = guard.get_mut(user_id) else {
            return Ok(0);
        };
        let before = turns.len();
        turns.retain(|stored| stored.turn.created_at >= cutoff);
        Ok((before - turns.len()) as u64)
    }
}
