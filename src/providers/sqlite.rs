use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use diesel::sqlite::SqliteConnection;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::{ScopedBoxFuture, ScopedFutureExt};
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::warn;

use crate::domains::chat::{ChatRole, HistoryTurn};
use crate::domains::job::{JobRun, JobStatus};
use crate::domains::subscription::{
    EventOutcome, SubscriptionEventLog, SubscriptionRecord, SubscriptionStatus,
};
use crate::domains::tier::Tier;
use crate::domains::usage::{
    ArchivedDay, CheckOutcome, CounterKind, ReconcileOutcome, Reservation, ReserveOutcome,
    UsageCounter,
};
use crate::error::{EngineError, Result};
use crate::interfaces::stores::{
    CommitOutcome, ConversationStore, JobRunStore, SubscriptionStore, UsageStore,
};

mod schema;
use schema::{
    chat_messages, job_runs, subscription_events, subscriptions, token_reservations,
    usage_archive, usage_counters,
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

const BUSY_TIMEOUT_MS: u32 = 5_000;

type SqliteAsyncConn = SyncConnectionWrapper<SqliteConnection>;
type SqlitePool = Pool<SqliteAsyncConn>;
type SqlitePooledConn<'a> = PooledConnection<'a, SqliteAsyncConn>;

#[derive(Queryable)]
struct CounterRow {
    user_id: String,
    day: String,
    messages_sent: i64,
    tokens_consumed: i64,
    personas_owned: i64,
    storage_bytes_used: i64,
    reset_at: Option<i64>,
    _updated_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = usage_counters)]
struct NewCounter<'a> {
    user_id: &'a str,
    day: &'a str,
    updated_at: i64,
}

#[derive(Queryable)]
struct ArchiveRow {
    user_id: String,
    day: String,
    messages_sent: i64,
    tokens_consumed: i64,
    archived_at: i64,
}

#[derive(Queryable)]
struct ReservationRow {
    _id: String,
    user_id: String,
    amount: i64,
    day: String,
    _created_at: i64,
    _actual_tokens: Option<i64>,
    reconciled_at: Option<i64>,
}

#[derive(Insertable)]
#[diesel(table_name = token_reservations)]
struct NewReservation<'a> {
    id: &'a str,
    user_id: &'a str,
    amount: i64,
    day: &'a str,
    created_at: i64,
}

#[derive(Queryable)]
struct SubscriptionRow {
    user_id: String,
    tier: String,
    status: String,
    expires_at: Option<i64>,
    grace_until: Option<i64>,
    auto_renew: bool,
    last_verified_event_id: Option<String>,
    last_event_at: Option<i64>,
    version: i64,
    updated_at: i64,
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = subscriptions, treat_none_as_null = true)]
struct SubscriptionWrite<'a> {
    user_id: &'a str,
    tier: &'a str,
    status: &'a str,
    expires_at: Option<i64>,
    grace_until: Option<i64>,
    auto_renew: bool,
    last_verified_event_id: Option<&'a str>,
    last_event_at: Option<i64>,
    version: i64,
    updated_at: i64,
}

#[derive(Queryable)]
struct EventRow {
    event_id: String,
    user_id: String,
    kind: String,
    tier: Option<String>,
    expires_at: Option<i64>,
    issued_at: i64,
    outcome: String,
    recorded_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = subscription_events)]
struct NewEvent<'a> {
    event_id: &'a str,
    user_id: &'a str,
    kind: &'a str,
    tier: Option<&'a str>,
    expires_at: Option<i64>,
    issued_at: i64,
    outcome: &'a str,
    recorded_at: i64,
}

#[derive(Queryable)]
struct JobRunRow {
    job_name: String,
    scheduled_for: String,
    status: String,
    affected_rows: i64,
    attempts: i32,
    started_at: i64,
    finished_at: Option<i64>,
    error: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = job_runs)]
struct NewJobRun<'a> {
    job_name: &'a str,
    scheduled_for: &'a str,
    status: &'a str,
    affected_rows: i64,
    attempts: i32,
    started_at: i64,
}

#[derive(Queryable)]
struct MessageRow {
    role: String,
    content: String,
    created_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = chat_messages)]
struct NewMessage<'a> {
    user_id: &'a str,
    persona_id: &'a str,
    role: &'a str,
    content: &'a str,
    created_at: i64,
}

#[derive(QueryableByName)]
struct ValueRow {
    #[diesel(sql_type = BigInt)]
    value: i64,
}

/// SQLite-backed implementation of every store trait. Writes go through a
/// process-wide gate and run in a single transaction each.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl SqliteStore {
    pub async fn new(sqlite_path: impl AsRef<str>) -> Result<Self> {
        let sqlite_path = sqlite_path.as_ref();
        ensure_parent_dir(sqlite_path)?;
        run_migrations(sqlite_path).await?;

        let manager = AsyncDieselConnectionManager::<SqliteAsyncConn>::new(sqlite_path);
        let pool: SqlitePool = Pool::builder()
            .build(manager)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(Self {
            pool,
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    async fn conn(&self) -> Result<SqlitePooledConn<'_>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        diesel::sql_query(format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))
            .execute(&mut conn)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(conn)
    }

    async fn write<R, F>(&self, callback: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'r> FnOnce(&'r mut SqliteAsyncConn) -> ScopedBoxFuture<'static, 'r, QueryResult<R>>
            + Send
            + 'static,
    {
        let _guard = self.write_gate.lock().await;
        let mut pooled = self.conn().await?;
        let conn: &mut SqliteAsyncConn = &mut pooled;
        conn.transaction(callback)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::Storage(e.to_string()))?;
    }
    Ok(())
}

async fn run_migrations(database_url: &str) -> Result<()> {
    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = SqliteConnection::establish(&database_url)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        conn.batch_execute("PRAGMA journal_mode = WAL;")
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok::<_, EngineError>(())
    })
    .await
    .map_err(|e| EngineError::Runtime(e.to_string()))??;
    Ok(())
}

fn counter_column(kind: CounterKind) -> &'static str {
    match kind {
        CounterKind::Messages => "messages_sent",
        CounterKind::Tokens => "tokens_consumed",
        CounterKind::Personas => "personas_owned",
        CounterKind::StorageBytes => "storage_bytes_used",
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

async fn counter_value(
    conn: &mut SqliteAsyncConn,
    user_id: &str,
    column: &str,
) -> QueryResult<Option<u64>> {
    let row: Option<ValueRow> = diesel::sql_query(format!(
        "SELECT {column} AS value FROM usage_counters WHERE user_id = ?1"
    ))
    .bind::<Text, _>(user_id)
    .get_result(conn)
    .await
    .optional()?;
    Ok(row.map(|row| to_u64(row.value)))
}

async fn increment_counter(
    conn: &mut SqliteAsyncConn,
    user_id: &str,
    day: &str,
    kind: CounterKind,
    amount: u64,
    limit: Option<u64>,
    now: i64,
) -> QueryResult<CheckOutcome> {
    diesel::insert_or_ignore_into(usage_counters::table)
        .values(&NewCounter {
            user_id,
            day,
            updated_at: now,
        })
        .execute(conn)
        .await?;

    let column = counter_column(kind);
    let applied = match limit {
        Some(limit) if amount > limit => 0,
        Some(limit) => {
            diesel::sql_query(format!(
                "UPDATE usage_counters SET {column} = {column} + ?1, updated_at = ?2 \
                 WHERE user_id = ?3 AND {column} <= ?4"
            ))
            .bind::<BigInt, _>(to_i64(amount))
            .bind::<BigInt, _>(now)
            .bind::<Text, _>(user_id)
            .bind::<BigInt, _>(to_i64(limit - amount))
            .execute(conn)
            .await?
        }
        None => {
            diesel::sql_query(format!(
                "UPDATE usage_counters SET {column} = {column} + ?1, updated_at = ?2 \
                 WHERE user_id = ?3"
            ))
            .bind::<BigInt, _>(to_i64(amount))
            .bind::<BigInt, _>(now)
            .bind::<Text, _>(user_id)
            .execute(conn)
            .await?
        }
    };

    let new_value = counter_value(conn, user_id, column).await?.unwrap_or(0);
    Ok(CheckOutcome {
        allowed: applied > 0,
        new_value,
    })
}

fn map_counter(row: CounterRow) -> UsageCounter {
    UsageCounter {
        user_id: row.user_id,
        day: row.day,
        messages_sent: to_u64(row.messages_sent),
        tokens_consumed: to_u64(row.tokens_consumed),
        personas_owned: to_u64(row.personas_owned),
        storage_bytes_used: to_u64(row.storage_bytes_used),
        reset_at: row.reset_at,
    }
}

fn map_subscription(row: SubscriptionRow) -> SubscriptionRecord {
    let tier = row.tier.parse::<Tier>().unwrap_or_else(|_| {
        warn!(user_id = %row.user_id, tier = %row.tier, "configuration anomaly: stored tier not recognized, treating as free");
        Tier::Free
    });
    let status = row.status.parse::<SubscriptionStatus>().unwrap_or_else(|_| {
        warn!(user_id = %row.user_id, status = %row.status, "stored subscription status not recognized, treating as expired");
        SubscriptionStatus::Expired
    });
    SubscriptionRecord {
        user_id: row.user_id,
        tier,
        status,
        expires_at: row.expires_at,
        grace_until: row.grace_until,
        auto_renew: row.auto_renew,
        last_verified_event_id: row.last_verified_event_id,
        last_event_at: row.last_event_at,
        version: row.version,
        updated_at: row.updated_at,
    }
}

fn map_event(row: EventRow) -> SubscriptionEventLog {
    SubscriptionEventLog {
        outcome: row.outcome.parse().unwrap_or(EventOutcome::Rejected),
        event_id: row.event_id,
        user_id: row.user_id,
        kind: row.kind,
        tier: row.tier,
        expires_at: row.expires_at,
        issued_at: row.issued_at,
        recorded_at: row.recorded_at,
    }
}

fn new_event(entry: &SubscriptionEventLog) -> NewEvent<'_> {
    NewEvent {
        event_id: &entry.event_id,
        user_id: &entry.user_id,
        kind: &entry.kind,
        tier: entry.tier.as_deref(),
        expires_at: entry.expires_at,
        issued_at: entry.issued_at,
        outcome: entry.outcome.as_str(),
        recorded_at: entry.recorded_at,
    }
}

fn map_job_run(row: JobRunRow) -> JobRun {
    JobRun {
        status: row.status.parse().unwrap_or(JobStatus::Failed),
        job_name: row.job_name,
        scheduled_for: row.scheduled_for,
        affected_rows: to_u64(row.affected_rows),
        attempts: row.attempts.max(0) as u32,
        started_at: row.started_at,
        finished_at: row.finished_at,
        error: row.error,
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn check_and_increment(
        &self,
        user_id: &str,
        day: &str,
        kind: CounterKind,
        amount: u64,
        limit: Option<u64>,
        now: i64,
    ) -> Result<CheckOutcome> {
        let user_id = user_id.to_string();
        let day = day.to_string();
        self.write(move |conn| {
            async move { increment_counter(conn, &user_id, &day, kind, amount, limit, now).await }
                .scope_boxed()
        })
        .await
    }

    async fn reserve_tokens(
        &self,
        reservation: &Reservation,
        limit: Option<u64>,
        now: i64,
    ) -> Result<ReserveOutcome> {
        let reservation = reservation.clone();
        self.write(move |conn| {
            async move {
                let outcome = increment_counter(
                    conn,
                    &reservation.user_id,
                    &reservation.day,
                    CounterKind::Tokens,
                    reservation.amount,
                    limit,
                    now,
                )
                .await?;
                let day: String = usage_counters::table
                    .find(&reservation.user_id)
                    .select(usage_counters::day)
                    .first(conn)
                    .await?;
                if outcome.allowed {
                    diesel::insert_into(token_reservations::table)
                        .values(&NewReservation {
                            id: &reservation.id,
                            user_id: &reservation.user_id,
                            amount: to_i64(reservation.amount),
                            day: &day,
                            created_at: now,
                        })
                        .execute(conn)
                        .await?;
                }
                Ok(ReserveOutcome {
                    allowed: outcome.allowed,
                    new_value: outcome.new_value,
                    day,
                })
            }
            .scope_boxed()
        })
        .await
    }

    async fn reconcile(
        &self,
        reservation: &Reservation,
        actual: u64,
        now: i64,
    ) -> Result<ReconcileOutcome> {
        let id = reservation.id.clone();
        let outcome = self
            .write(move |conn| {
                async move {
                    let row: Option<ReservationRow> = token_reservations::table
                        .find(&id)
                        .first(conn)
                        .await
                        .optional()?;
                    let Some(row) = row else {
                        return Ok(None);
                    };
                    if row.reconciled_at.is_some() {
                        return Ok(Some(ReconcileOutcome::AlreadyApplied));
                    }

                    diesel::update(token_reservations::table.find(&id))
                        .set((
                            token_reservations::actual_tokens.eq(Some(to_i64(actual))),
                            token_reservations::reconciled_at.eq(Some(now)),
                        ))
                        .execute(conn)
                        .await?;

                    let live = diesel::sql_query(
                        "UPDATE usage_counters \
                         SET tokens_consumed = MAX(0, tokens_consumed - ?1) + ?2, updated_at = ?3 \
                         WHERE user_id = ?4 AND day = ?5",
                    )
                    .bind::<BigInt, _>(row.amount)
                    .bind::<BigInt, _>(to_i64(actual))
                    .bind::<BigInt, _>(now)
                    .bind::<Text, _>(&row.user_id)
                    .bind::<Text, _>(&row.day)
                    .execute(conn)
                    .await?;

                    if live > 0 {
                        let tokens_today = counter_value(conn, &row.user_id, "tokens_consumed")
                            .await?
                            .unwrap_or(0);
                        return Ok(Some(ReconcileOutcome::Applied { tokens_today }));
                    }

                    diesel::sql_query(
                        "UPDATE usage_archive \
                         SET tokens_consumed = MAX(0, tokens_consumed - ?1) + ?2 \
                         WHERE user_id = ?3 AND day = ?4",
                    )
                    .bind::<BigInt, _>(row.amount)
                    .bind::<BigInt, _>(to_i64(actual))
                    .bind::<Text, _>(&row.user_id)
                    .bind::<Text, _>(&row.day)
                    .execute(conn)
                    .await?;
                    Ok(Some(ReconcileOutcome::DayClosed))
                }
                .scope_boxed()
            })
            .await?;
        outcome.ok_or_else(|| EngineError::NotFound(format!("reservation {}", reservation.id)))
    }

    async fn release(
        &self,
        user_id: &str,
        kind: CounterKind,
        amount: u64,
        now: i64,
    ) -> Result<u64> {
        if kind.is_day_scoped() {
            return Err(EngineError::InvalidInput(format!(
                "{kind} is day-scoped and cannot be released"
            )));
        }
        let user_id = user_id.to_string();
        self.write(move |conn| {
            async move {
                let column = counter_column(kind);
                diesel::sql_query(format!(
                    "UPDATE usage_counters SET {column} = MAX(0, {column} - ?1), updated_at = ?2 \
                     WHERE user_id = ?3"
                ))
                .bind::<BigInt, _>(to_i64(amount))
                .bind::<BigInt, _>(now)
                .bind::<Text, _>(&user_id)
                .execute(conn)
                .await?;
                Ok(counter_value(conn, &user_id, column).await?.unwrap_or(0))
            }
            .scope_boxed()
        })
        .await
    }

    async fn reset_counter(&self, user_id: &str, kind: CounterKind, now: i64) -> Result<bool> {
        if !kind.is_day_scoped() {
            return Err(EngineError::InvalidInput(format!(
                "{kind} is a running total and is never reset"
            )));
        }
        let user_id = user_id.to_string();
        self.write(move |conn| {
            async move {
                let column = counter_column(kind);
                let updated = diesel::sql_query(format!(
                    "UPDATE usage_counters SET {column} = 0, reset_at = ?1, updated_at = ?1 \
                     WHERE user_id = ?2"
                ))
                .bind::<BigInt, _>(now)
                .bind::<Text, _>(&user_id)
                .execute(conn)
                .await?;
                Ok(updated > 0)
            }
            .scope_boxed()
        })
        .await
    }

    async fn reset_day(&self, day: &str, now: i64) -> Result<u64> {
        let day = day.to_string();
        self.write(move |conn| {
            async move {
                diesel::sql_query(
                    "INSERT INTO usage_archive (user_id, day, messages_sent, tokens_consumed, archived_at) \
                     SELECT user_id, day, messages_sent, tokens_consumed, ?1 \
                     FROM usage_counters WHERE day < ?2 \
                     ON CONFLICT(user_id, day) DO UPDATE SET \
                       messages_sent = excluded.messages_sent, \
                       tokens_consumed = excluded.tokens_consumed, \
                       archived_at = excluded.archived_at",
                )
                .bind::<BigInt, _>(now)
                .bind::<Text, _>(&day)
                .execute(conn)
                .await?;

                let reset = diesel::sql_query(
                    "UPDATE usage_counters \
                     SET messages_sent = 0, tokens_consumed = 0, day = ?1, reset_at = ?2, updated_at = ?2 \
                     WHERE day < ?1",
                )
                .bind::<Text, _>(&day)
                .bind::<BigInt, _>(now)
                .execute(conn)
                .await?;

                diesel::delete(
                    token_reservations::table.filter(
                        token_reservations::day
                            .lt(&day)
                            .and(token_reservations::reconciled_at.is_not_null()),
                    ),
                )
                .execute(conn)
                .await?;

                Ok(reset as u64)
            }
            .scope_boxed()
        })
        .await
    }

    async fn counters(&self, user_id: &str) -> Result<Option<UsageCounter>> {
        let mut conn = self.conn().await?;
        let row: Option<CounterRow> = usage_counters::table
            .find(user_id)
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(row.map(map_counter))
    }

    async fn archived_days(
        &self,
        user_id: &str,
        from_day: &str,
        to_day: &str,
    ) -> Result<Vec<ArchivedDay>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ArchiveRow> = usage_archive::table
            .filter(usage_archive::user_id.eq(user_id))
            .filter(usage_archive::day.ge(from_day))
            .filter(usage_archive::day.le(to_day))
            .order(usage_archive::day.asc())
            .load(&mut conn)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| ArchivedDay {
                user_id: row.user_id,
                day: row.day,
                messages_sent: to_u64(row.messages_sent),
                tokens_consumed: to_u64(row.tokens_consumed),
                archived_at: row.archived_at,
            })
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionRecord>> {
        let mut conn = self.conn().await?;
        let row: Option<SubscriptionRow> = subscriptions::table
            .find(user_id)
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(row.map(map_subscription))
    }

    async fn commit(
        &self,
        record: &SubscriptionRecord,
        expected_version: i64,
        event: Option<&SubscriptionEventLog>,
    ) -> Result<CommitOutcome> {
        let record = record.clone();
        let event = event.cloned();
        self.write(move |conn| {
            async move {
                if let Some(event) = &event {
                    let seen: i64 = subscription_events::table
                        .filter(subscription_events::event_id.eq(&event.event_id))
                        .count()
                        .get_result(conn)
                        .await?;
                    if seen > 0 {
                        return Ok(CommitOutcome::DuplicateEvent);
                    }
                }

                let row = SubscriptionWrite {
                    user_id: &record.user_id,
                    tier: record.tier.as_str(),
                    status: record.status.as_str(),
                    expires_at: record.expires_at,
                    grace_until: record.grace_until,
                    auto_renew: record.auto_renew,
                    last_verified_event_id: record.last_verified_event_id.as_deref(),
                    last_event_at: record.last_event_at,
                    version: expected_version + 1,
                    updated_at: record.updated_at,
                };
                let written = if expected_version == 0 {
                    diesel::insert_or_ignore_into(subscriptions::table)
                        .values(&row)
                        .execute(conn)
                        .await?
                } else {
                    diesel::update(
                        subscriptions::table
                            .filter(subscriptions::user_id.eq(&record.user_id))
                            .filter(subscriptions::version.eq(expected_version)),
                    )
                    .set(&row)
                    .execute(conn)
                    .await?
                };
                if written == 0 {
                    return Ok(CommitOutcome::VersionConflict);
                }

                if let Some(event) = &event {
                    diesel::insert_into(subscription_events::table)
                        .values(&new_event(event))
                        .execute(conn)
                        .await?;
                }
                Ok(CommitOutcome::Committed)
            }
            .scope_boxed()
        })
        .await
    }

    async fn log_event(&self, entry: &SubscriptionEventLog) -> Result<bool> {
        let entry = entry.clone();
        self.write(move |conn| {
            async move {
                let inserted = diesel::insert_or_ignore_into(subscription_events::table)
                    .values(&new_event(&entry))
                    .execute(conn)
                    .await?;
                Ok(inserted > 0)
            }
            .scope_boxed()
        })
        .await
    }

    async fn find_event(&self, event_id: &str) -> Result<Option<SubscriptionEventLog>> {
        let mut conn = self.conn().await?;
        let row: Option<EventRow> = subscription_events::table
            .find(event_id)
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(row.map(map_event))
    }

    async fn events(&self, user_id: &str, limit: usize) -> Result<Vec<SubscriptionEventLog>> {
        let mut conn = self.conn().await?;
        let mut query = subscription_events::table
            .filter(subscription_events::user_id.eq(user_id))
            .order((
                subscription_events::recorded_at.desc(),
                subscription_events::issued_at.desc(),
            ))
            .into_boxed();
        if limit > 0 {
            query = query.limit(limit as i64);
        }
        let rows: Vec<EventRow> = query
            .load(&mut conn)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_event).collect())
    }

    async fn due_for_grace(&self, now: i64, limit: usize) -> Result<Vec<SubscriptionRecord>> {
        let mut conn = self.conn().await?;
        let rows: Vec<SubscriptionRow> = subscriptions::table
            .filter(subscriptions::status.eq(SubscriptionStatus::Active.as_str()))
            .filter(subscriptions::expires_at.is_not_null())
            .filter(subscriptions::expires_at.le(now))
            .order(subscriptions::expires_at.asc())
            .limit(limit as i64)
            .load(&mut conn)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_subscription).collect())
    }

    async fn due_for_expiry(&self, now: i64, limit: usize) -> Result<Vec<SubscriptionRecord>> {
        let mut conn = self.conn().await?;
        let rows: Vec<SubscriptionRow> = subscriptions::table
            .filter(subscriptions::status.eq(SubscriptionStatus::Grace.as_str()))
            .filter(subscriptions::grace_until.is_not_null())
            .filter(subscriptions::grace_until.le(now))
            .order(subscriptions::grace_until.asc())
            .limit(limit as i64)
            .load(&mut conn)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_subscription).collect())
    }
}

#[async_trait]
impl JobRunStore for SqliteStore {
    async fn try_claim(
        &self,
        job_name: &str,
        slot: &str,
        now: i64,
        lease_seconds: i64,
    ) -> Result<bool> {
        let job_name = job_name.to_string();
        let slot = slot.to_string();
        self.write(move |conn| {
            async move {
                let existing: Option<JobRunRow> = job_runs::table
                    .find((&job_name, &slot))
                    .first(conn)
                    .await
                    .optional()?;
                let Some(existing) = existing else {
                    diesel::insert_into(job_runs::table)
                        .values(&NewJobRun {
                            job_name: &job_name,
                            scheduled_for: &slot,
                            status: JobStatus::Running.as_str(),
                            affected_rows: 0,
                            attempts: 1,
                            started_at: now,
                        })
                        .execute(conn)
                        .await?;
                    return Ok(true);
                };

                let status = existing.status.parse().unwrap_or(JobStatus::Failed);
                let claimable = match status {
                    JobStatus::Completed => false,
                    JobStatus::Running => existing.started_at + lease_seconds <= now,
                    JobStatus::Pending | JobStatus::Failed => true,
                };
                if !claimable {
                    return Ok(false);
                }

                diesel::update(job_runs::table.find((&job_name, &slot)))
                    .set((
                        job_runs::status.eq(JobStatus::Running.as_str()),
                        job_runs::attempts.eq(existing.attempts + 1),
                        job_runs::started_at.eq(now),
                        job_runs::finished_at.eq(None::<i64>),
                        job_runs::error.eq(None::<String>),
                    ))
                    .execute(conn)
                    .await?;
                Ok(true)
            }
            .scope_boxed()
        })
        .await
    }

    async fn complete(
        &self,
        job_name: &str,
        slot: &str,
        affected_rows: u64,
        now: i64,
    ) -> Result<()> {
        let job_name = job_name.to_string();
        let slot = slot.to_string();
        self.write(move |conn| {
            async move {
                diesel::update(job_runs::table.find((&job_name, &slot)))
                    .set((
                        job_runs::status.eq(JobStatus::Completed.as_str()),
                        job_runs::affected_rows.eq(to_i64(affected_rows)),
                        job_runs::finished_at.eq(Some(now)),
                        job_runs::error.eq(None::<String>),
                    ))
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn fail(&self, job_name: &str, slot: &str, error: &str, now: i64) -> Result<()> {
        let job_name = job_name.to_string();
        let slot = slot.to_string();
        let error = error.to_string();
        self.write(move |conn| {
            async move {
                diesel::update(job_runs::table.find((&job_name, &slot)))
                    .set((
                        job_runs::status.eq(JobStatus::Failed.as_str()),
                        job_runs::finished_at.eq(Some(now)),
                        job_runs::error.eq(Some(error.as_str())),
                    ))
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn get(&self, job_name: &str, slot: &str) -> Result<Option<JobRun>> {
        let mut conn = self.conn().await?;
        let row: Option<JobRunRow> = job_runs::table
            .find((job_name, slot))
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(row.map(map_job_run))
    }

    async fn runs(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>> {
        let mut conn = self.conn().await?;
        let rows: Vec<JobRunRow> = job_runs::table
            .filter(job_runs::job_name.eq(job_name))
            .order(job_runs::started_at.desc())
            .limit(limit.max(1) as i64)
            .load(&mut conn)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_job_run).collect())
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn append(
        &self,
        user_id: &str,
        persona_id: &str,
        role: ChatRole,
        content: &str,
        created_at: i64,
    ) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let mut conn = self.conn().await?;
        diesel::insert_into(chat_messages::table)
            .values(&NewMessage {
                user_id,
                persona_id,
                role: role.as_str(),
                content,
                created_at,
            })
            .execute(&mut conn)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn recent(
        &self,
        user_id: &str,
        persona_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryTurn>> {
        let mut conn = self.conn().await?;
        let mut query = chat_messages::table
            .filter(chat_messages::user_id.eq(user_id))
            .filter(chat_messages::persona_id.eq(persona_id))
            .order((chat_messages::created_at.desc(), chat_messages::id.desc()))
            .select((
                chat_messages::role,
                chat_messages::content,
                chat_messages::created_at,
            ))
            .into_boxed();
        if limit > 0 {
            query = query.limit(limit as i64);
        }
        let rows: Vec<MessageRow> = query
            .load(&mut conn)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(rows
            .into_iter()
            .rev()
            .map(|row| HistoryTurn {
                role: ChatRole::parse(&row.role),
                content: row.content,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn users_with_history(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        chat_messages::table
            .select(chat_messages::user_id)
            .distinct()
            .order(chat_messages::user_id.asc())
            .load(&mut conn)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    async fn delete_older_than(&self, user_id: &str, cutoff: i64) -> Result<u64> {
        let _guard = self.write_gate.lock().await;
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(
            chat_messages::table.filter(
                chat_messages::user_id
                    .eq(user_id)
                    .and(chat_messages::created_at.lt(cutoff)),
            ),
        )
        .execute(&mut conn)
        .await
        .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(deleted as u64)
    }
}
