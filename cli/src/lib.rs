//! `huddle`: operator CLI over a file-backed sync engine.
//!
//! ## Commands
//!
//! - `huddle status` - session, queue and breaker state
//! - `huddle drain` - send queued mutations now
//! - `huddle reconcile [--strategy S] [--override JSON]` - settle the
//!   cached profile against the server
//! - `huddle migrate [--no-validate] [--no-backup]` - push the cached
//!   profile to the server
//! - `huddle reset` - forget all local state

mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use huddle_engine::AuthProvider;
use huddle_engine::Capabilities;
use huddle_engine::ConfigLoader;
use huddle_engine::EngineStatus;
use huddle_engine::ReconcileOutcome;
use huddle_engine::StaticAuth;
use huddle_engine::SyncEngine;
use huddle_engine::SyncOutcome;
use huddle_protocol::NetworkStatus;
use huddle_protocol::SystemClock;
use huddle_protocol::Timestamp;
use huddle_reconcile::ConflictStrategy;
use huddle_reconcile::MigrationOptions;
use huddle_store::FileStore;
use tokio::sync::watch;

pub use http::HttpBackend;

#[derive(Debug, Parser)]
#[command(name = "huddle", about = "Inspect and drive the onboarding sync engine")]
pub struct Cli {
    /// Config file; defaults to ./huddle.toml or the user config dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the local session files.
    #[arg(long, global = true, env = "HUDDLE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "HUDDLE_API_URL",
        default_value = "http://localhost:3000/api"
    )]
    pub api_url: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show session, queue and circuit breaker state
    Status,

    /// Send every queued mutation now
    Drain,

    /// Compare the cached profile with the server and resolve conflicts
    Reconcile {
        /// local-wins, remote-wins, merge or manual
        #[arg(long)]
        strategy: Option<ConflictStrategy>,

        /// JSON object merged onto the local profile (manual strategy)
        #[arg(long = "override", value_name = "JSON")]
        manual_override: Option<String>,
    },

    /// Push the cached profile to the server
    Migrate {
        #[arg(long)]
        no_validate: bool,

        #[arg(long)]
        no_backup: bool,

        /// Refuse to migrate over a divergent server profile
        #[arg(long)]
        check_conflicts: bool,
    },

    /// Forget all local session state
    Reset,
}

/// Credentials from `HUDDLE_TOKEN` and `HUDDLE_USER_ID`.
pub fn auth_from_env() -> StaticAuth {
    match (
        std::env::var("HUDDLE_TOKEN").ok(),
        std::env::var("HUDDLE_USER_ID").ok(),
    ) {
        (Some(token), Some(user_id)) if !token.is_empty() && !user_id.is_empty() => {
            StaticAuth::new(token, user_id)
        }
        _ => StaticAuth::anonymous(),
    }
}

pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("huddle"))
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let auth = auth_from_env();
    let output = execute(cli, auth).await?;
    println!("{output}");
    Ok(())
}

/// Run one command and return what it would print.
pub async fn execute(cli: Cli, auth: StaticAuth) -> anyhow::Result<String> {
    let config = match &cli.config {
        Some(path) => ConfigLoader::new().with_file(path).load()?,
        None => ConfigLoader::load_default()?,
    };
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(default_data_dir)
        .context("no data directory available; pass --data-dir")?;
    let store = FileStore::new(&data_dir)
        .with_context(|| format!("cannot open data dir {}", data_dir.display()))?;
    let backend = Arc::new(HttpBackend::new(&cli.api_url, auth.token()));
    // A one-shot command treats the host as online; the engine is never
    // started, so no watcher listens for changes.
    let (_network_tx, network) = watch::channel(NetworkStatus::Online);
    let engine = SyncEngine::new(
        config,
        Capabilities {
            store: Arc::new(store),
            auth: Arc::new(auth),
            clock: Arc::new(SystemClock),
            transport: backend.clone(),
            profile_api: backend,
            network,
        },
    );

    let output = match cli.command {
        Command::Status => render_status(&engine.status()),
        Command::Drain => match engine.sync_now().await {
            SyncOutcome::Completed(report) if report.deferred > 0 => format!(
                "sent {}, retained {}, dropped {}, deferred {} (circuit open)",
                report.success, report.retained, report.failed, report.deferred
            ),
            SyncOutcome::Completed(report) => format!(
                "sent {}, retained {}, dropped {}",
                report.success, report.retained, report.failed
            ),
            SyncOutcome::Skipped(reason) => format!("skipped: {reason:?}"),
        },
        Command::Reconcile {
            strategy,
            manual_override,
        } => {
            let strategy = strategy.unwrap_or(engine.config().conflict_strategy);
            let manual_override = manual_override
                .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
                .transpose()
                .context("--override must be valid JSON")?;
            let outcome = engine
                .reconcile_with(strategy, manual_override.as_ref())
                .await?;
            render_reconcile(&outcome)
        }
        Command::Migrate {
            no_validate,
            no_backup,
            check_conflicts,
        } => {
            let options = MigrationOptions {
                validate_data: !no_validate,
                create_backup: !no_backup,
                check_conflicts,
                ..engine.config().migration.clone()
            };
            let result = engine.migrate_with(&options).await?;
            match result.error {
                None => format!("migrated {} records", result.migrated_records),
                Some(err) => anyhow::bail!("migration failed: {err}"),
            }
        }
        Command::Reset => {
            engine.reset();
            "local state cleared".to_string()
        }
    };
    Ok(output)
}

fn format_time(at: Option<Timestamp>) -> String {
    at.and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
}

fn render_status(status: &EngineStatus) -> String {
    let session = match &status.session {
        Some(session) => format!(
            "{} (step {}, completed {:?}, active {})",
            session.session_id,
            session.current_step,
            session.completed_steps,
            format_time(Some(session.last_active_time))
        ),
        None => "none".to_string(),
    };
    [
        format!("session:        {session}"),
        format!("resume step:    {}", status.resume_step),
        format!("authenticated:  {}", status.authenticated),
        format!("pending items:  {}", status.pending),
        format!("breaker:        {:?}", status.breaker.state),
        format!("last sync:      {}", format_time(status.recovery.last_sync_time)),
        format!("recoveries:     {}", status.recovery.recovery_count),
        format!("migrated:       {}", status.migration_complete),
        format!("storage:        {}", if status.storage_degraded { "degraded" } else { "ok" }),
    ]
    .join("\n")
}

fn render_reconcile(outcome: &ReconcileOutcome) -> String {
    match outcome {
        ReconcileOutcome::NoLocalData => "no profile locally or on the server".to_string(),
        ReconcileOutcome::AdoptedRemote(_) => "adopted the server profile".to_string(),
        ReconcileOutcome::Migrated(result) if result.success => {
            format!("server had no profile; migrated {} records", result.migrated_records)
        }
        ReconcileOutcome::Migrated(result) => format!(
            "server had no profile; migration failed: {}",
            result
                .error
                .as_ref()
                .map_or_else(|| "unknown error".to_string(), ToString::to_string)
        ),
        ReconcileOutcome::InSync => "profiles already agree".to_string(),
        ReconcileOutcome::Resolved {
            strategy,
            conflicts,
            ..
        } => format!("resolved {} conflict(s) with {strategy}", conflicts.len()),
        ReconcileOutcome::NeedsManualResolution { conflicts, .. } => format!(
            "manual resolution required:\n  {}\nrerun with --override '<json>'",
            conflicts.join("\n  ")
        ),
    }
}
