use clap::Parser;
use persona_engine::config::{Config, DatabaseConfig};
use persona_engine::daemon;
use persona_engine::error::{EngineError, Result};
use persona_engine::PersonaEngine;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "persona-engined")]
#[command(about = "Quota, subscription and chat streaming daemon")]
struct Cli {
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 7979)]
    port: u16,

    /// Overrides `database.sqlite_path`.
    #[arg(long)]
    db: Option<String>,

    #[arg(long, env = "PERSONA_ENGINE_TOKEN", default_value = "")]
    token: String,

    /// Used when the config file carries no `openai.api_key`.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Run one scheduler job (daily_reset, grace_sweep, retention_cleanup)
    /// and exit.
    #[arg(long)]
    run_job: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,persona_engine=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(db) = cli.db {
        config.database = Some(DatabaseConfig {
            sqlite_path: Some(db),
        });
    }
    if let Some(api_key) = cli.openai_api_key {
        let mut openai = config.openai.take().unwrap_or_default();
        if openai.api_key.is_none() {
            openai.api_key = Some(api_key);
        }
        config.openai = Some(openai);
    }

    if let Some(name) = cli.run_job {
        let engine = PersonaEngine::from_config(config).await?;
        let job = engine
            .job(&name)
            .ok_or_else(|| EngineError::NotFound(format!("job {name}")))?;
        let tick = job.run().await?;
        tracing::info!(job = %name, ?tick, "job finished");
        return Ok(());
    }

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            futures::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    };
    daemon::run_with_shutdown(&cli.host, cli.port, config, &cli.token, shutdown).await
}
