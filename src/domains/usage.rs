use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    Messages,
    Tokens,
    Personas,
    StorageBytes,
}

impl CounterKind {
    /// Day-scoped counters are zeroed by the daily reset; the others are
    /// running totals.
    pub fn is_day_scoped(&self) -> bool {
        matches!(self, CounterKind::Messages | CounterKind::Tokens)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::Messages => "messages",
            CounterKind::Tokens => "tokens",
            CounterKind::Personas => "personas",
            CounterKind::StorageBytes => "storage_bytes",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterKind {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "messages" => Ok(CounterKind::Messages),
            "tokens" => Ok(CounterKind::Tokens),
            "personas" => Ok(CounterKind::Personas),
            "storage_bytes" => Ok(CounterKind::StorageBytes),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub allowed: bool,
    /// Counter value after the call; unchanged when rejected.
    pub new_value: u64,
}

/// Outcome of a token reservation. `day` is the day of the counter row that
/// took the charge, which lags the wall-clock day until the daily reset runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReserveOutcome {
    pub allowed: bool,
    pub new_value: u64,
    pub day: String,
}

/// Live counters for one user. `day` is the calendar day the day-scoped
/// counters belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageCounter {
    pub user_id: String,
    pub day: String,
    pub messages_sent: u64,
    pub tokens_consumed: u64,
    pub personas_owned: u64,
    pub storage_bytes_used: u64,
    pub reset_at: Option<i64>,
}

impl UsageCounter {
    pub fn empty(user_id: &str, day: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            day: day.to_string(),
            messages_sent: 0,
            tokens_consumed: 0,
            personas_owned: 0,
            storage_bytes_used: 0,
            reset_at: None,
        }
    }

    pub fn value(&self, kind: CounterKind) -> u64 {
        match kind {
            CounterKind::Messages => self.messages_sent,
            CounterKind::Tokens => self.tokens_consumed,
            CounterKind::Personas => self.personas_owned,
            CounterKind::StorageBytes => self.storage_bytes_used,
        }
    }

    pub fn value_mut(&mut self, kind: CounterKind) -> &mut u64 {
        match kind {
            CounterKind::Messages => &mut self.messages_sent,
            CounterKind::Tokens => &mut self.tokens_consumed,
            CounterKind::Personas => &mut self.personas_owned,
            CounterKind::StorageBytes => &mut self.storage_bytes_used,
        }
    }
}

/// A closed day's day-scoped counters, kept for audit after the reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedDay {
    pub user_id: String,
    pub day: String,
    pub messages_sent: u64,
    pub tokens_consumed: u64,
    pub archived_at: i64,
}

/// Provisional token charge taken before a stream starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub amount: u64,
    pub day: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied { tokens_today: u64 },
    AlreadyApplied,
    /// Reservation belongs to a day that has since been reset; the
    /// correction lands on that day's archived row instead.
    DayClosed,
}
