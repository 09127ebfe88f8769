use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use care_monitor::activity::ActivityLog;
use care_monitor::analysis::LlmAnalyzer;
use care_monitor::blob::{BlobStore, FsBlobStore};
use care_monitor::config::{MonitorConfig, StaleStreamPolicy};
use care_monitor::db::{self, PgStore};
use care_monitor::evaluator::Evaluator;
use care_monitor::llm::{LlmClient, OllamaClient};
use care_monitor::models::{AdminId, AlertId, PatientId, Stream};
use care_monitor::poller::Poller;
use care_monitor::recommendation::{self, LlmRecommender, RecommendationPipeline};
use care_monitor::store::RecordStore;
use care_monitor::{report, scanner};

#[derive(Parser)]
#[command(name = "care-monitor")]
#[command(
    about = "Incremental clinical monitoring and alerting for care coordinators",
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Settings {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Base URL of the Ollama-compatible LLM endpoint
    #[arg(
        long,
        env = "CARE_MONITOR_LLM_URL",
        default_value = "http://localhost:11434",
        global = true
    )]
    llm_url: String,

    #[arg(long, env = "CARE_MONITOR_LLM_MODEL", default_value = "medgemma", global = true)]
    llm_model: String,

    /// Directory holding recommendation and activity objects
    #[arg(long, env = "CARE_MONITOR_BLOB_DIR", default_value = "blobs", global = true)]
    blob_dir: PathBuf,

    #[arg(long, default_value_t = 60, global = true)]
    interval_secs: u64,

    #[arg(long, default_value_t = 30, global = true)]
    window_days: i64,

    #[arg(long, default_value_t = care_monitor::dedup::DEFAULT_THRESHOLD, global = true)]
    dedup_threshold: usize,

    /// Checkpoint handling for streams with no record in the window
    #[arg(long, value_enum, default_value_t = StaleStreamPolicy::Overwrite, global = true)]
    stale_streams: StaleStreamPolicy,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import clinical records of one stream from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, value_enum)]
        stream: Stream,
    },
    /// Run the monitoring loop until interrupted
    Monitor,
    /// Run a single monitoring cycle
    RunOnce {
        /// Write a markdown summary of the cycle
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Re-evaluate one patient now
    Evaluate {
        #[arg(long)]
        patient_id: PatientId,
    },
    /// Print the stored recommendation for an alert
    Recommendation {
        #[arg(long)]
        alert_id: AlertId,
    },
    /// Count open alerts created recently
    RecentAlerts {
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(i64).range(1..))]
        minutes: i64,
    },
    /// Admin activity history
    Activity {
        #[command(subcommand)]
        command: ActivityCommand,
    },
}

#[derive(Subcommand)]
enum ActivityCommand {
    /// Append an activity line
    Log {
        #[arg(long)]
        admin_id: AdminId,
        #[arg(long)]
        text: String,
    },
    /// Show the ten most recent activities
    Show {
        #[arg(long)]
        admin_id: AdminId,
    },
}

impl Settings {
    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.interval_secs.max(1)),
            window: chrono::Duration::days(self.window_days.max(1)),
            dedup_threshold: self.dedup_threshold,
            stale_streams: self.stale_streams,
            ..MonitorConfig::default()
        }
    }

    fn recommendation_blobs(&self) -> Arc<dyn BlobStore> {
        Arc::new(FsBlobStore::new(self.blob_dir.join("recommendations")))
    }

    fn activity_blobs(&self) -> Arc<dyn BlobStore> {
        Arc::new(FsBlobStore::new(self.blob_dir.join("activity")))
    }

    async fn connect(&self) -> anyhow::Result<PgPool> {
        let database_url = self
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")?;
        PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")
    }

    fn evaluator(&self, pool: PgPool) -> anyhow::Result<Arc<Evaluator>> {
        let config = self.monitor_config();
        let llm: Arc<dyn LlmClient> = Arc::new(
            OllamaClient::new(&self.llm_url, &self.llm_model, config.llm_deadline)
                .context("failed to build LLM client")?,
        );
        let recommendations = RecommendationPipeline::new(
            Arc::new(LlmRecommender::new(llm.clone())),
            self.recommendation_blobs(),
            config.recommendation_context,
            config.llm_deadline,
            config.blob_deadline,
        );
        Ok(Arc::new(Evaluator::new(
            Arc::new(PgStore::new(pool)),
            Arc::new(LlmAnalyzer::new(llm)),
            recommendations,
            config,
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = cli.settings;

    match cli.command {
        Commands::InitDb => {
            let pool = settings.connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = settings.connect().await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv, stream } => {
            let pool = settings.connect().await?;
            let inserted = db::import_csv(&pool, stream, &csv).await?;
            println!("Inserted {inserted} {stream} records from {}.", csv.display());
        }
        Commands::Monitor => {
            let pool = settings.connect().await?;
            let poller = Arc::new(Poller::new(settings.evaluator(pool)?));
            let handle = poller.start();
            shutdown_signal().await;
            info!("stopping monitoring loop");
            handle.stop().await;
        }
        Commands::RunOnce { out } => {
            let pool = settings.connect().await?;
            let poller = Poller::new(settings.evaluator(pool)?);
            let summary = poller.run_cycle(&CancellationToken::new()).await?;
            println!(
                "Evaluated {} of {} candidates: {} alerts created, {} failed.",
                summary.evaluated(),
                summary.candidates,
                summary.alerted.len(),
                summary.failed.len()
            );
            if let Some(out) = out {
                std::fs::write(&out, report::build_report(&summary))?;
                println!("Report written to {}.", out.display());
            }
        }
        Commands::Evaluate { patient_id } => {
            let pool = settings.connect().await?;
            let evaluator = settings.evaluator(pool)?;
            let since = scanner::window_start(Utc::now(), evaluator.config().window);
            let outcome = evaluator
                .evaluate(patient_id, since)
                .await
                .with_context(|| format!("evaluation of patient {patient_id} failed"))?;
            println!("Patient {patient_id}: {outcome:?}");
        }
        Commands::Recommendation { alert_id } => {
            let pool = settings.connect().await?;
            let store = PgStore::new(pool);
            let patient_id = store.alert_patient(alert_id).await?;
            let blobs = settings.recommendation_blobs();
            match recommendation::lookup_recommendation(blobs.as_ref(), alert_id, patient_id)
                .await?
            {
                Some(text) => println!("{text}"),
                None => println!("No recommendation stored for alert {alert_id}."),
            }
        }
        Commands::RecentAlerts { minutes } => {
            let pool = settings.connect().await?;
            let store = PgStore::new(pool);
            let since = Utc::now() - chrono::Duration::minutes(minutes);
            let count = store.count_recent_open_alerts(since).await?;
            println!("{count} open alerts created in the last {minutes} minutes.");
        }
        Commands::Activity { command } => {
            let log = ActivityLog::new(settings.activity_blobs());
            match command {
                ActivityCommand::Log { admin_id, text } => {
                    log.log(admin_id, &text).await?;
                    println!("Activity recorded.");
                }
                ActivityCommand::Show { admin_id } => {
                    let activities = log.recent(admin_id).await?;
                    if activities.is_empty() {
                        println!("No activity recorded for admin {admin_id}.");
                    }
                    for line in activities {
                        println!("- {line}");
                    }
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_alerts_rejects_zero_minutes() {
        assert!(Cli::try_parse_from(["care-monitor", "recent-alerts", "--minutes", "0"]).is_err());

        let cli =
            Cli::try_parse_from(["care-monitor", "recent-alerts", "--minutes", "15"]).unwrap();
        assert!(matches!(cli.command, Commands::RecentAlerts { minutes: 15 }));
    }
}
