// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Command-line front end for master key rotation.
//!
//! Usage:
//!   kekrotate create-key --description "orders KEK"
//!   kekrotate rotate --old-key kek-... [--dry-run] [--concurrency 4]
//!   kekrotate resume
//!   kekrotate rollback --backup .kekrotate/backups/dek_backup_....json
//!   kekrotate status --json
//!   kekrotate backups
//!
//! Exit codes: 0 on success, 1 on any failure (failed records and failed
//! verification included), 2 on usage errors.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kekrotate::{
    create_backend, BackendConfig, BackendKind, JsonFileRecordStore, KeyBackend, KeyRetirement,
    RotationConfig, RotationEngine, RotationPaths, RotationProgress, RotationRequest,
    RotationResult, VerificationSampling,
};

#[derive(Parser)]
#[command(name = "kekrotate", version, about = "Rotate the master key protecting a set of DEKs")]
struct Cli {
    /// Directory holding the checkpoint, audit log and backups.
    #[arg(long, global = true, default_value = ".kekrotate")]
    state_dir: PathBuf,

    /// JSON file holding the DEK records.
    #[arg(long, global = true, default_value = "deks.json")]
    records: PathBuf,

    /// Key backend: local or aws-kms.
    #[arg(long, global = true, default_value = "local")]
    backend: BackendKind,

    /// Key directory for the local backend [default: <state-dir>/keys].
    #[arg(long, global = true)]
    key_store: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mint a new master key
    #[command(name = "create-key")]
    CreateKey {
        #[arg(long, default_value = "kekrotate master key")]
        description: String,
    },
    /// Re-wrap every DEK under a new master key
    Rotate(RotateParams),
    /// Continue an interrupted rotation
    Resume(RunParams),
    /// Restore the record set from a backup
    Rollback {
        /// Backup file written by a previous run.
        #[arg(long)]
        backup: PathBuf,
    },
    /// Show the current checkpoint
    Status {
        /// Show the dry-run checkpoint instead.
        #[arg(long)]
        dry_run: bool,
    },
    /// List backup files, newest first
    Backups,
}

#[derive(Args)]
struct RotateParams {
    /// Master key currently wrapping the DEKs.
    #[arg(long)]
    old_key: String,

    /// Existing master key to rotate to. A new key is minted if omitted.
    #[arg(long)]
    new_key: Option<String>,

    /// Rehearse the run without backend calls or record changes.
    #[arg(long)]
    dry_run: bool,

    /// Description for a newly minted master key.
    #[arg(long, default_value = "kekrotate master key")]
    key_description: String,

    /// Retire the old key after a successful run.
    #[arg(long, value_enum, default_value_t = Retirement::Keep)]
    retire_old_key: Retirement,

    /// Grace period for scheduled deletion.
    #[arg(long, default_value_t = 30)]
    deletion_window_days: u64,

    #[command(flatten)]
    run: RunParams,
}

#[derive(Args)]
struct RunParams {
    /// Records processed concurrently.
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Timeout for each backend call, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Records verified under the new key after the run.
    #[arg(long)]
    sample_size: Option<usize>,

    /// Save records after this many rotations (0 = only at the end).
    #[arg(long, default_value_t = 100)]
    checkpoint_interval: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum Retirement {
    Keep,
    Disable,
    ScheduleDeletion,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    configure_logging(cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            for cause in err.chain().skip(1) {
                eprintln!("Caused by: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}

fn configure_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Text => subscriber.try_init(),
    };
    if let Err(e) = installed {
        eprintln!("Failed to initialize logging: {e}");
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let key_store = cli
        .key_store
        .clone()
        .unwrap_or_else(|| cli.state_dir.join("keys"));
    let backend = create_backend(&BackendConfig::local(key_store).with_kind(cli.backend))
        .await
        .context("failed to initialize key backend")?;

    match cli.command {
        Commands::CreateKey { ref description } => {
            let key = backend
                .create_master_key(description)
                .await
                .context("failed to create master key")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&key)?);
            } else {
                println!("Created master key {} (version {})", key.key_id, key.version);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rotate(ref params) => {
            let config = run_config(&params.run)
                .with_dry_run(params.dry_run)
                .with_key_description(&params.key_description);
            let engine = open_engine(&cli, backend, config)?;
            let mut request = RotationRequest::new(&params.old_key);
            if let Some(new_key) = &params.new_key {
                request = request.with_new_key(new_key);
            }

            let mut result = engine.rotate(request).await?;
            if result.success && !result.dry_run {
                let retirement = match params.retire_old_key {
                    Retirement::Keep => KeyRetirement::Keep,
                    Retirement::Disable => KeyRetirement::Disable,
                    Retirement::ScheduleDeletion => KeyRetirement::ScheduleDeletion(
                        Duration::from_secs(params.deletion_window_days * 86_400),
                    ),
                };
                if let Err(e) = engine.retire_old_key(&result, retirement).await {
                    warn!(error = %e, "Rotation succeeded but the old key was not retired");
                    result.warnings.push(format!("old key not retired: {e}"));
                }
            }
            print_result(&result, cli.json)
        }
        Commands::Resume(ref params) => {
            let engine = open_engine(&cli, backend, run_config(params))?;
            let result = engine.resume().await?;
            print_result(&result, cli.json)
        }
        Commands::Rollback { ref backup } => {
            let engine = open_engine(&cli, backend, RotationConfig::default())?;
            let result = engine.rollback(backup).await?;
            print_result(&result, cli.json)
        }
        Commands::Status { dry_run } => {
            let config = RotationConfig::default().with_dry_run(dry_run);
            let engine = open_engine(&cli, backend, config)?;
            print_status(engine.status()?, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backups => {
            let engine = open_engine(&cli, backend, RotationConfig::default())?;
            let backups = engine.list_backups()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            } else if backups.is_empty() {
                println!("No backups");
            } else {
                for backup in backups {
                    println!("{}", backup.display());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_config(params: &RunParams) -> RotationConfig {
    let mut config = RotationConfig::default()
        .with_concurrency(params.concurrency)
        .with_backend_timeout(Duration::from_secs(params.timeout_secs))
        .with_checkpoint_interval(params.checkpoint_interval);
    if let Some(n) = params.sample_size {
        config = config.with_verification(VerificationSampling::Fixed(n));
    }
    config
}

/// Builds the engine and cancels it on Ctrl-C.
fn open_engine(
    cli: &Cli,
    backend: Arc<dyn KeyBackend>,
    config: RotationConfig,
) -> anyhow::Result<RotationEngine> {
    let store = Arc::new(JsonFileRecordStore::new(&cli.records));
    let paths = RotationPaths::new(&cli.state_dir);
    let engine = RotationEngine::open(backend, store, &paths, config)
        .with_context(|| format!("failed to open state directory {}", cli.state_dir.display()))?;

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after in-flight records");
            token.cancel();
        }
    });
    Ok(engine)
}

fn print_result(result: &RotationResult, json: bool) -> anyhow::Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        let outcome = if result.success { "SUCCESS" } else { "FAILED" };
        println!("Rotation {outcome} ({})", result.status);
        println!("  run id:        {}", result.run_id);
        println!("  old key:       {}", result.old_key_id);
        println!("  new key:       {}", result.new_key_id);
        println!("  rotated:       {}", result.deks_rotated);
        println!("  failed:        {}", result.deks_failed);
        for record_id in &result.failed_records {
            println!("    - {record_id}");
        }
        println!("  duration:      {:.2}s", result.duration.as_secs_f64());
        if let Some(backup) = &result.backup_location {
            println!("  backup:        {}", backup.display());
        }
        println!("  audit log:     {}", result.audit_log_location.display());
        if let Some(verification) = &result.verification {
            println!(
                "  verification:  {} ({} sampled)",
                if verification.passed { "passed" } else { "FAILED" },
                verification.sampled
            );
            for (record_id, reason) in &verification.failures {
                println!("    - {record_id}: {reason}");
            }
        }
        if result.dry_run {
            println!("  dry run:       no records were changed");
        }
        if let Some(error) = &result.error {
            println!("  error:         {error}");
        }
        for warning in &result.warnings {
            println!("  WARNING: {warning}");
        }
    }
    Ok(ExitCode::from(result.exit_code() as u8))
}

fn print_status(progress: Option<RotationProgress>, json: bool) -> anyhow::Result<()> {
    let Some(progress) = progress else {
        if json {
            println!("null");
        } else {
            println!("No rotation checkpoint");
        }
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }
    println!("Run {} is {}", progress.run_id, progress.status);
    println!("  old key:   {}", progress.old_key.key_id);
    println!("  new key:   {}", progress.new_key.key_id);
    println!(
        "  progress:  {}/{} ({:.1}%), {} failed",
        progress.processed_deks,
        progress.total_deks,
        progress.progress_percentage(),
        progress.failed_deks
    );
    println!("  started:   {}", progress.start_time.to_rfc3339());
    if let Some(end) = progress.end_time {
        println!("  finished:  {}", end.to_rfc3339());
    }
    if progress.dry_run {
        println!("  dry run");
    }
    Ok(())
}
