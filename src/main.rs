//! # Stevedore command-line entry point
//!
//! Operator commands for applying migrations, running a worker, enqueueing
//! smoke-test jobs, and inspecting the queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stevedore::{
    Argument, EnqueueRequest, JobRepository, JobStore, QueueSettings, QueueStats, Registry,
    Retention, Scheduler, Worker, builtin, config::ConfigLoader, db, settings, telemetry,
};

const MAX_DELAY_SECONDS: i64 = settings::MAX_WINDOW_SECONDS as i64;

#[derive(Debug, Parser)]
#[command(name = "stevedore", version, about = "Durable priority job queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Run a worker until interrupted
    Work {
        /// Run a single poll and exit
        #[arg(long)]
        once: bool,
    },
    /// Enqueue a job
    Enqueue {
        target: String,
        action: String,
        /// Positional argument as JSON; bare words are taken as strings
        #[arg(long = "arg")]
        args: Vec<String>,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,
        /// Seconds to wait before the job becomes eligible
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=MAX_DELAY_SECONDS))]
        delay: Option<i64>,
    },
    /// Delete completed jobs past the retention window
    Cleanup,
    /// Print job counts per state
    Stats,
}

fn parse_argument(raw: &str) -> Argument {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(value) => Argument::from_json(value),
        Err(_) => Argument::from(raw),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;
    settings::install(QueueSettings::from_config(&config.queue));
    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    if let Command::Migrate = cli.command {
        db::migrate(&db).await?;
        println!("migrations applied");
        return Ok(());
    }

    let store: Arc<dyn JobStore> = Arc::new(JobRepository::new(db));

    match cli.command {
        Command::Migrate => {}
        Command::Work { once } => {
            let mut registry = Registry::new();
            builtin::register(&mut registry)?;
            let worker = Worker::new(store, Arc::new(registry), config.queue.worker_config());

            if once {
                let report = worker.tick().await?;
                println!("{}", serde_json::to_string(&report)?);
                return Ok(());
            }

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(err) => warn!(error = %err, "Failed to listen for shutdown signal"),
                }
                signal_token.cancel();
            });

            worker.run(shutdown).await?;
        }
        Command::Enqueue {
            target,
            action,
            args,
            priority,
            delay,
        } => {
            let mut request = EnqueueRequest::new(target, action)
                .args(args.iter().map(|raw| parse_argument(raw)).collect())
                .priority(priority);
            if let Some(seconds) = delay {
                request = request.delay(Duration::seconds(seconds));
            }

            let id = Scheduler::new(store).enqueue(request).await?;
            println!("{id}");
        }
        Command::Cleanup => {
            let deleted = Retention::new(store).cleanup().await?;
            println!("{deleted}");
        }
        Command::Stats => {
            let stats = QueueStats::collect(store.as_ref()).await?;
            println!("{}", serde_json::to_string(&stats)?);
        }
    }

    Ok(())
}
