use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::interfaces::providers::{LlmProvider, PersonaSource};
use crate::interfaces::scheduler::ScheduledJob;
use crate::interfaces::stores::{ConversationStore, JobRunStore, SubscriptionStore, UsageStore};
use crate::providers::memory::InMemoryStore;
use crate::providers::openai::OpenAiProvider;
use crate::providers::personas::StaticPersonaSource;
use crate::providers::sqlite::SqliteStore;
use crate::scheduler::jobs::{DailyResetJob, GraceSweepJob, JobRunner, RetentionCleanupJob};
use crate::scheduler::Scheduler;
use crate::services::chat::ChatService;
use crate::services::gate::QuotaGate;
use crate::services::ledger::QuotaLedger;
use crate::services::streaming::StreamingProxy;
use crate::services::subscription::SubscriptionService;
use crate::services::tier_policy::TierPolicy;
use crate::services::usage::UsageService;

/// Collaborators the engine is wired from.
pub struct EngineParts {
    pub usage: Arc<dyn UsageStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub jobs: Arc<dyn JobRunStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub personas: Arc<dyn PersonaSource>,
    pub llm: Arc<dyn LlmProvider>,
    pub clock: Arc<dyn Clock>,
}

impl EngineParts {
    /// Every store backed by one shared in-memory instance.
    pub fn in_memory(
        llm: Arc<dyn LlmProvider>,
        personas: Arc<dyn PersonaSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            usage: store.clone(),
            subscriptions: store.clone(),
            jobs: store.clone(),
            conversations: store,
            personas,
            llm,
            clock,
        }
    }
}

/// The wired quota, subscription and chat core.
pub struct PersonaEngine {
    pub policy: Arc<TierPolicy>,
    pub ledger: Arc<QuotaLedger>,
    pub subscriptions: Arc<SubscriptionService>,
    pub gate: Arc<QuotaGate>,
    pub chat: Arc<ChatService>,
    pub usage: Arc<UsageService>,
    jobs: Vec<Arc<dyn ScheduledJob>>,
    scheduler_enabled: bool,
}

impl PersonaEngine {
    /// SQLite persistence, the OpenAI upstream and the configured personas.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(config.sqlite_path()).await?);
        let llm = OpenAiProvider::from_config(&config.openai.clone().unwrap_or_default())?;
        let parts = EngineParts {
            usage: store.clone(),
            subscriptions: store.clone(),
            jobs: store.clone(),
            conversations: store,
            personas: Arc::new(StaticPersonaSource::new(config.personas.clone())),
            llm: Arc::new(llm),
            clock: Arc::new(SystemClock),
        };
        Ok(Self::with_parts(&config, parts))
    }

    pub async fn from_config_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::from_file(path)?;
        Self::from_config(config).await
    }

    pub fn with_parts(config: &Config, parts: EngineParts) -> Self {
        let EngineParts {
            usage,
            subscriptions,
            jobs,
            conversations,
            personas,
            llm,
            clock,
        } = parts;

        let policy = Arc::new(TierPolicy::from_config(config));
        let ledger = Arc::new(
            QuotaLedger::new(usage, clock.clone())
                .with_day_offset(config.day_offset_hours())
                .with_tolerance(config.reconcile_tolerance_tokens()),
        );
        let subscription_service = Arc::new(SubscriptionService::new(
            subscriptions,
            clock.clone(),
            config.grace_days(),
        ));
        let gate = Arc::new(QuotaGate::new(
            subscription_service.clone(),
            policy.clone(),
            ledger.clone(),
            config.reserved_tokens_per_message(),
        ));
        let proxy = Arc::new(StreamingProxy::new(llm, ledger.clone()));
        let chat = Arc::new(
            ChatService::new(
                gate.clone(),
                personas,
                conversations.clone(),
                proxy,
                clock.clone(),
            )
            .with_token_budget(config.context_token_budget())
            .with_history_limit(config.history_limit())
            .with_max_completion_tokens(Some(config.max_completion_tokens())),
        );
        let usage_service = Arc::new(UsageService::new(
            ledger.clone(),
            subscription_service.clone(),
            policy.clone(),
        ));

        let runner = JobRunner::new(jobs, clock).with_lease_seconds(config.job_lease_seconds());
        let job_list: Vec<Arc<dyn ScheduledJob>> = vec![
            Arc::new(DailyResetJob::new(
                runner.clone(),
                ledger.clone(),
                Duration::from_secs(config.daily_reset_poll_seconds().max(1)),
            )),
            Arc::new(GraceSweepJob::new(
                runner.clone(),
                subscription_service.clone(),
                Duration::from_secs(config.grace_sweep_seconds().max(1)),
            )),
            Arc::new(RetentionCleanupJob::new(
                runner,
                ledger.clone(),
                subscription_service.clone(),
                policy.clone(),
                conversations,
                Duration::from_secs(config.retention_poll_seconds().max(1)),
            )),
        ];

        Self {
            policy,
            ledger,
            subscriptions: subscription_service,
            gate,
            chat,
            usage: usage_service,
            jobs: job_list,
            scheduler_enabled: config.scheduler_enabled(),
        }
    }

    pub fn jobs(&self) -> &[Arc<dyn ScheduledJob>] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Option<Arc<dyn ScheduledJob>> {
        self.jobs.iter().find(|job| job.name() == name).cloned()
    }

    pub fn scheduler_enabled(&self) -> bool {
        self.scheduler_enabled
    }

    /// A scheduler with every recurring job registered; not yet started.
    pub fn scheduler(&self) -> Scheduler {
        let mut scheduler = Scheduler::new();
        for job in &self.jobs {
            scheduler.register_job(job.clone());
        }
        scheduler
    }
}
