use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rflow_extract::{ExtractionEngine, PortalProfile, UnavailableBrowser};
use rflow_storage::{
    apply_schema, CredentialCipher, PgRosterStore, PgUserDirectory, RosterStore, UserDirectory,
};
use rflow_sync::{
    BatchRunner, ReconcileEngine, ReconcilePolicy, ReconcileStatus, RestCalendarProvider,
    SyncConfig, SyncOrchestrator, SyncRequest, TokioSpawner,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rflow")]
#[command(about = "Mirrors a work roster from the scheduling portal into a calendar")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one person's roster and mirror it to their calendar.
    Sync {
        #[arg(long)]
        person: String,
        /// Portal password; stored encrypted for later runs.
        #[arg(long)]
        password: Option<String>,
        /// Scrape even when the sync interval has not elapsed.
        #[arg(long)]
        force: bool,
        /// Treat this run as a credential check: a portal login failure is
        /// reported instead of degrading to cached data.
        #[arg(long)]
        verify: bool,
        /// Cap on calendar mutations for this run.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Sync every user with a stored credential.
    Batch,
    /// Forget a person: stored roster, credential and sync state.
    Reset {
        #[arg(long)]
        person: String,
    },
    /// Serve the HTTP API.
    Serve,
    /// Apply the database schema.
    Migrate,
    /// Print a fresh credential encryption key for RFLOW_CREDENTIAL_KEY.
    GenerateKey,
}

struct Runtime {
    orchestrator: Arc<SyncOrchestrator>,
    store: Arc<dyn RosterStore>,
    directory: Arc<dyn UserDirectory>,
    batch: Arc<BatchRunner>,
}

async fn build_runtime(config: &SyncConfig) -> Result<Runtime> {
    if config.credential_key.is_empty() {
        bail!("RFLOW_CREDENTIAL_KEY is not set; run `rflow generate-key` and export it");
    }
    let cipher = CredentialCipher::from_hex_key(&config.credential_key)
        .context("RFLOW_CREDENTIAL_KEY is not a valid key")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    apply_schema(&pool).await.context("applying the schema")?;

    let store: Arc<dyn RosterStore> = Arc::new(PgRosterStore::new(pool.clone()));
    let directory: Arc<dyn UserDirectory> =
        Arc::new(PgUserDirectory::new(pool, cipher.clone()));
    let extractor = Arc::new(ExtractionEngine::new(
        Arc::new(UnavailableBrowser),
        PortalProfile::for_base_url(&config.portal_base_url),
    ));
    let reconciler = Arc::new(ReconcileEngine::new(
        Arc::new(RestCalendarProvider::new(config.clone(), directory.clone())),
        directory.clone(),
        ReconcilePolicy::from_config(config),
    ));
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        directory.clone(),
        extractor,
        reconciler,
        cipher,
        Arc::new(TokioSpawner),
    ));
    let batch = Arc::new(BatchRunner::new(
        orchestrator.clone(),
        directory.clone(),
        config.batch_interval_minutes,
        Duration::from_secs(config.batch_delay_secs),
    ));

    Ok(Runtime {
        orchestrator,
        store,
        directory,
        batch,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync {
            person,
            password,
            force,
            verify,
            limit,
        } => {
            let runtime = build_runtime(&config).await?;
            let response = runtime
                .orchestrator
                .run(SyncRequest {
                    person,
                    password,
                    force,
                    verify,
                    mutation_limit: limit,
                })
                .await?;
            println!("{}: {}", response.person, response.message);
            println!(
                "entries: {} (live: {}, history from: {})",
                response.entries.len(),
                response.is_live,
                response
                    .historical_from
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "n/a".into())
            );
            match response.reconciliation {
                ReconcileStatus::Completed { summary } => println!(
                    "calendar: {} inserted, {} updated, {} deleted ({} skipped on error)",
                    summary.inserted, summary.updated, summary.deleted, summary.skipped_errors
                ),
                ReconcileStatus::Scheduled => println!("calendar: reconciling in background"),
                ReconcileStatus::Skipped { reason } => println!("calendar: skipped ({reason})"),
                ReconcileStatus::Failed { error } => println!("calendar: failed ({error})"),
            }
        }
        Commands::Batch => {
            let runtime = build_runtime(&config).await?;
            let outcome = runtime.batch.run().await?;
            for line in &outcome.lines {
                println!("{line}");
            }
            println!(
                "batch complete: {} users, {} synced, {} skipped, {} failed",
                outcome.total, outcome.synced, outcome.skipped, outcome.failed
            );
        }
        Commands::Reset { person } => {
            let runtime = build_runtime(&config).await?;
            let removed = runtime.store.purge_person(&person).await?;
            runtime.directory.reset(&person).await?;
            println!("{person}: account reset, {removed} stored entries removed");
        }
        Commands::Serve => {
            let runtime = build_runtime(&config).await?;
            rflow_web::serve(
                &config.bind_addr,
                rflow_web::AppState {
                    orchestrator: runtime.orchestrator,
                    store: runtime.store,
                    directory: runtime.directory,
                    batch: runtime.batch,
                    batch_secret: config.batch_secret.clone(),
                },
            )
            .await?;
        }
        Commands::Migrate => {
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(&config.database_url)
                .await
                .context("connecting to the database")?;
            apply_schema(&pool).await?;
            println!("schema applied");
        }
        Commands::GenerateKey => {
            println!("{}", CredentialCipher::generate_hex_key());
        }
    }

    Ok(())
}
