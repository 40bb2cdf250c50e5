pub mod jobs;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::interfaces::scheduler::{JobTick, ScheduledJob};

/// Runs each registered job on its own interval until stopped.
pub struct Scheduler {
    jobs: Vec<Arc<dyn ScheduledJob>>,
    handles: Vec<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            handles: Vec::new(),
            stop_tx: None,
        }
    }

    pub fn register_job(&mut self, job: Arc<dyn ScheduledJob>) {
        self.jobs.push(job);
    }

    pub fn jobs(&self) -> &[Arc<dyn ScheduledJob>] {
        &self.jobs
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    /// Spawns one timer task per job. Missed ticks are skipped, so a slow run
    /// never triggers a burst of catch-up runs.
    pub fn start(&mut self) {
        if self.stop_tx.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        for job in &self.jobs {
            let job = job.clone();
            let mut stop_rx = stop_rx.clone();
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(job.interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => run_tick(job.as_ref()).await,
                        changed = stop_rx.changed() => {
                            if changed.is_err() || *stop_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!(job = job.name(), "job loop stopped");
            }));
        }
        info!(jobs = self.jobs.len(), "scheduler started");
        self.stop_tx = Some(stop_tx);
    }

    /// Signals every job loop and waits for in-flight runs to finish.
    pub async fn stop(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "scheduler task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

async fn run_tick(job: &dyn ScheduledJob) {
    match job.run().await {
        Ok(JobTick::Ran {
            slot,
            affected_rows,
        }) => info!(job = job.name(), slot = %slot, affected_rows, "job completed"),
        Ok(JobTick::Skipped { slot }) => {
            debug!(job = job.name(), slot = %slot, "job slot already handled")
        }
        Ok(JobTick::Idle) => {}
        Err(err) => error!(job = job.name(), error = %err, "scheduled job failed"),
    }
}
