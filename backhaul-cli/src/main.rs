/*!
Backhaul CLI - back up a directory into a restic repository, or restore a
snapshot from one.

Every option can also be given through its `BACKHAUL_*` environment variable.
*/

use anyhow::Context;
use backhaul_core::config::{BackendKind, EngineOptions, OrchestratorOptions, StorageConfig};
use backhaul_core::engine::progress::format_bytes;
use backhaul_core::engine::{BackupSummary, ResticEngine, RestoreSummary};
use backhaul_core::observability::init_observability;
use backhaul_core::session::{
    enter_repository_password, ClusterClients, ClusterIdentityResolver, HttpTokenService,
    SecretPrompt, SessionManager,
};
use backhaul_core::{BackhaulError, Engine, StorageOrchestrator};
use clap::{Args, Parser, Subcommand};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// API server address used when no cluster lookups are needed
const UNUSED_CLUSTER_API: &str = "https://kubernetes.default.svc";

#[derive(Parser)]
#[command(name = "backhaul")]
#[command(about = "Back up and restore directories with restic")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true, env = "BACKHAUL_JSON_LOGS")]
    json_logs: bool,

    #[command(flatten)]
    storage: StorageArgs,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StorageArgs {
    /// Repository name, also used to tag snapshots
    #[arg(long, global = true, env = "BACKHAUL_REPO_NAME", default_value = "")]
    repo_name: String,

    /// Backend type: olares-space, s3, cos or local
    #[arg(long, global = true, env = "BACKHAUL_BACKEND", default_value = "olares-space")]
    backend: String,

    /// Identity owning the managed space
    #[arg(long, global = true, env = "BACKHAUL_IDENTITY")]
    identity: Option<String>,

    /// Bucket endpoint for the s3 and cos backends
    #[arg(long, global = true, env = "BACKHAUL_ENDPOINT")]
    endpoint: Option<String>,

    /// Access key id for the s3 and cos backends
    #[arg(long, global = true, env = "BACKHAUL_ACCESS_KEY_ID")]
    access_key_id: Option<String>,

    /// Secret access key for the s3 and cos backends
    #[arg(long, global = true, env = "BACKHAUL_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: Option<String>,

    /// Repository root for the local backend
    #[arg(long, global = true, env = "BACKHAUL_LOCAL_PATH")]
    local_path: Option<PathBuf>,

    /// Alternative base URL of the credential service
    #[arg(long, global = true, env = "BACKHAUL_CLOUD_API_MIRROR")]
    cloud_api_mirror: Option<String>,

    /// Lifetime of issued credentials in minutes
    #[arg(long, global = true, env = "BACKHAUL_TOKEN_DURATION")]
    token_duration: Option<String>,

    /// Repository password; prompted for when absent
    #[arg(long, global = true, env = "BACKHAUL_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Args)]
struct EngineArgs {
    /// restic executable to use instead of the one on PATH
    #[arg(long, global = true, env = "BACKHAUL_RESTIC")]
    restic: Option<PathBuf>,

    /// Upload limit in KiB/s
    #[arg(long, global = true, env = "BACKHAUL_LIMIT_UPLOAD_RATE")]
    limit_upload_rate: Option<String>,

    /// Download limit in KiB/s
    #[arg(long, global = true, env = "BACKHAUL_LIMIT_DOWNLOAD_RATE")]
    limit_download_rate: Option<String>,

    /// Verify TLS certificates of the repository endpoint
    #[arg(long, global = true, env = "BACKHAUL_SECURE_TLS")]
    secure_tls: bool,

    /// Give up on a backup or restore after this many minutes
    #[arg(long, global = true, env = "BACKHAUL_TIMEOUT_MINUTES", default_value_t = 120)]
    timeout_minutes: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a directory
    Backup {
        /// Directory to back up
        path: PathBuf,
    },
    /// Restore a snapshot into a directory
    Restore {
        /// Snapshot id or id prefix
        snapshot_id: String,
        /// Existing directory to restore into
        target: PathBuf,
    },
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

fn row(field: &'static str, value: impl ToString) -> SummaryRow {
    SummaryRow {
        field,
        value: value.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let Cli {
        verbose,
        json_logs,
        storage,
        engine,
        command,
    } = Cli::parse();

    init_observability(json_logs, verbose)?;

    match command {
        Commands::Backup { path } => {
            let summary = {
                let mut orchestrator = build_orchestrator(&storage, &engine, true)?;
                let root = orchestrator.engine().root_scope();
                interruptible(root, orchestrator.backup(&path)).await?
            };
            print_backup_summary(&summary);
        }
        Commands::Restore {
            snapshot_id,
            target,
        } => {
            let summary = {
                let mut orchestrator = build_orchestrator(&storage, &engine, false)?;
                let root = orchestrator.engine().root_scope();
                interruptible(root, orchestrator.restore(&snapshot_id, &target)).await?
            };
            print_restore_summary(&summary);
        }
    }

    Ok(())
}

fn storage_config(args: &StorageArgs) -> Result<StorageConfig, anyhow::Error> {
    let backend: BackendKind = args.backend.parse()?;
    Ok(StorageConfig {
        backend,
        repo_name: args.repo_name.clone(),
        identity_id: args.identity.clone(),
        endpoint: args.endpoint.clone(),
        access_key_id: args.access_key_id.clone(),
        secret_access_key: args.secret_access_key.clone(),
        local_path: args.local_path.clone(),
        cloud_api_mirror: args.cloud_api_mirror.clone(),
        token_duration_minutes: args.token_duration.clone(),
    })
}

fn build_orchestrator(
    storage: &StorageArgs,
    engine: &EngineArgs,
    confirm_password: bool,
) -> Result<StorageOrchestrator<ResticEngine>, anyhow::Error> {
    let config = storage_config(storage)?;
    config.validate()?;

    let engine_options = EngineOptions {
        binary: engine.restic.clone(),
        limit_upload_rate: engine.limit_upload_rate.clone(),
        limit_download_rate: engine.limit_download_rate.clone(),
        insecure_tls: !engine.secure_tls,
    };
    let restic = ResticEngine::new(&config.repo_name, engine_options, CancellationToken::new())
        .context("restic is required")?;
    info!(restic = %restic.binary().display(), "Using engine");

    let clients = if config.backend.uses_issued_tokens() {
        ClusterClients::in_cluster().context("managed space backups need cluster access")?
    } else {
        ClusterClients::new(UNUSED_CLUSTER_API, None)?
    };
    let resolver = Arc::new(ClusterIdentityResolver::new(clients));
    let tokens = Arc::new(HttpTokenService::new(config.cloud_api_url())?);

    let password = match &storage.password {
        Some(password) => password.clone(),
        None => enter_repository_password(&mut TerminalPrompt, confirm_password)?,
    };

    let session = SessionManager::new(config, password, resolver, tokens)?;
    let options = OrchestratorOptions {
        deadline: Duration::from_secs(engine.timeout_minutes.max(1) * 60),
        ..OrchestratorOptions::default()
    };
    Ok(StorageOrchestrator::new(session, restic, options))
}

/// Run `work`, cancelling the engine scope on Ctrl-C
async fn interruptible<T>(
    root: CancellationToken,
    work: impl Future<Output = backhaul_core::Result<T>>,
) -> Result<T, anyhow::Error> {
    tokio::select! {
        result = work => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping restic");
            root.cancel();
            Err(BackhaulError::Cancelled("operation").into())
        }
    }
}

fn print_backup_summary(summary: &BackupSummary) {
    let rows = vec![
        row("Snapshot", &summary.snapshot_id),
        row("Files new", summary.files_new),
        row("Files changed", summary.files_changed),
        row("Files unmodified", summary.files_unmodified),
        row("Dirs new", summary.dirs_new),
        row("Dirs changed", summary.dirs_changed),
        row("Data added", format_bytes(summary.data_added)),
        row("Files processed", summary.total_files_processed),
        row("Bytes processed", format_bytes(summary.total_bytes_processed)),
        row("Duration", format!("{:.1}s", summary.total_duration)),
    ];
    println!("{}", Table::new(rows));
}

fn print_restore_summary(summary: &RestoreSummary) {
    let rows = vec![
        row("Files restored", format!("{}/{}", summary.files_restored, summary.total_files)),
        row("Files skipped", summary.files_skipped),
        row("Bytes restored", format_bytes(summary.bytes_restored)),
        row("Bytes skipped", format_bytes(summary.bytes_skipped)),
        row("Total size", format_bytes(summary.total_bytes)),
        row("Elapsed", format!("{}s", summary.seconds_elapsed)),
    ];
    println!("{}", Table::new(rows));
}

/// Reads secrets from the terminal without echo
struct TerminalPrompt;

struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

impl SecretPrompt for TerminalPrompt {
    fn notify(&mut self, message: &str) -> backhaul_core::Result<()> {
        eprintln!("{message}");
        Ok(())
    }

    fn read_secret(&mut self, label: &str) -> backhaul_core::Result<String> {
        eprint!("{label}");
        io::stderr().flush()?;

        let mut secret = String::new();
        {
            let _raw = RawMode::enable()?;
            loop {
                let Event::Key(KeyEvent {
                    code,
                    modifiers,
                    kind,
                    ..
                }) = event::read()?
                else {
                    continue;
                };
                if kind != KeyEventKind::Press {
                    continue;
                }
                match code {
                    KeyCode::Enter => break,
                    KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                        return Err(BackhaulError::Cancelled("password entry"));
                    }
                    KeyCode::Char(c) => secret.push(c),
                    KeyCode::Backspace => {
                        secret.pop();
                    }
                    _ => {}
                }
            }
        }

        eprintln!();
        Ok(secret)
    }
}
