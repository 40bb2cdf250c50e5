use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of one scheduler tick for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTick {
    /// The slot was claimed and processed.
    Ran { slot: String, affected_rows: u64 },
    /// Another run already completed or currently holds the slot.
    Skipped { slot: String },
    /// Nothing is due yet.
    Idle,
}

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;
    fn interval(&self) -> Duration;
    async fn run(&self) -> Result<JobTick>;
}
