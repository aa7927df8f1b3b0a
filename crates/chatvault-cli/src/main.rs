//! chatvault: encrypted chat backup CLI
//!
//! Key and settings:
//!   setup                      - set up the backup PIN or passphrase
//!   rotate                     - change the secret, re-encrypting the newest backup
//!   set-destination <dest>     - move backups to another destination
//!   acknowledge-risk <dest>    - accept a third-party destination's risk notice
//!   enable | disable           - turn backups on or off
//!
//! Backups:
//!   backup [--incremental]     - back up the message store now
//!   restore <id> [--out FILE]  - restore a backup and its ancestors
//!   history [--remote]         - list backups
//!   delete <id> | delete-all | prune --keep N
//!
//! Diagnostics:
//!   activity | health | auto-status | config show

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatvault_backup::{
    write_jsonl, AutoBackupPolicy, BackupOrchestrator, BackupRequest, BackupTask,
    JsonlFileSource, Ledger, MessageSource, ProgressEvent, ProgressFn, RestoreRequest, RunState,
    StaticSource,
};
use chatvault_core::config::ChatvaultConfig;
use chatvault_core::now_millis;
use chatvault_core::types::{BackupDestination, BackupId, BackupType};
use chatvault_crypto::BackupSecret;
use chatvault_storage::{OurServersAdapter, S3Credentials, ThirdPartyAdapter};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "chatvault",
    version,
    about = "End-to-end encrypted chat backups",
    long_about = "chatvault: back up and restore chat history encrypted under a PIN or passphrase"
)]
struct Cli {
    /// Path to chatvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CHATVAULT_CONFIG",
        default_value = "~/.config/chatvault/config.toml"
    )]
    config: PathBuf,

    /// Local ledger file (overrides account.state_file)
    #[arg(long, env = "CHATVAULT_STATE")]
    state: Option<PathBuf>,

    /// JSONL message store to back up from
    #[arg(long, short = 'm', env = "CHATVAULT_MESSAGES")]
    messages: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CHATVAULT_LOG", default_value = "warn")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "CHATVAULT_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set up the backup PIN or passphrase
    ///
    /// The secret is read from CHATVAULT_SECRET when set, otherwise prompted.
    Setup {
        /// Use a passphrase instead of a numeric PIN
        #[arg(long)]
        passphrase: bool,
    },

    /// Back up the message store now
    Backup {
        /// Only store messages added or changed since the last backup
        #[arg(long)]
        incremental: bool,
        /// Destination (default: the selected one)
        #[arg(long)]
        to: Option<BackupDestination>,
        #[arg(long)]
        passphrase: bool,
    },

    /// Restore a backup and every backup it builds on
    Restore {
        backup_id: BackupId,
        /// Destination to restore from (default: the selected one)
        #[arg(long)]
        from: Option<BackupDestination>,
        /// Write restored messages here as JSONL (default: the --messages store)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        #[arg(long)]
        passphrase: bool,
    },

    /// List completed backups
    History {
        /// List what the destination holds instead of the local ledger
        #[arg(long)]
        remote: bool,
        #[arg(long)]
        destination: Option<BackupDestination>,
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Delete a backup and every incremental built on it
    Delete {
        backup_id: BackupId,
        #[arg(long)]
        destination: Option<BackupDestination>,
    },

    /// Delete every backup at a destination
    #[command(name = "delete-all")]
    DeleteAll {
        #[arg(long)]
        destination: Option<BackupDestination>,
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Keep the newest N full backups (with their incrementals), delete the rest
    Prune {
        #[arg(long)]
        keep: usize,
        #[arg(long)]
        destination: Option<BackupDestination>,
    },

    /// Change the PIN or passphrase
    Rotate {
        /// The current secret is a passphrase
        #[arg(long)]
        old_passphrase: bool,
        /// The new secret is a passphrase
        #[arg(long)]
        passphrase: bool,
        #[arg(long)]
        destination: Option<BackupDestination>,
    },

    /// Move backups to another destination and select it
    #[command(name = "set-destination")]
    SetDestination {
        destination: BackupDestination,
        #[arg(long)]
        passphrase: bool,
    },

    /// Show and accept a third-party destination's risk notice
    #[command(name = "acknowledge-risk")]
    AcknowledgeRisk {
        destination: BackupDestination,
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Turn backups on
    Enable,

    /// Turn backups off
    Disable,

    /// Show the activity log
    Activity {
        /// Most recent entries to show
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
    },

    /// Check that a destination is configured and reachable
    Health {
        #[arg(long)]
        destination: Option<BackupDestination>,
    },

    /// Whether an automatic backup is due now
    #[command(name = "auto-status")]
    AutoStatus {
        /// The device is on Wi-Fi
        #[arg(long)]
        wifi: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);

    let config_path = expand_tilde(&cli.config);
    let config = ChatvaultConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;
    debug!(config = %config_path.display(), "configuration loaded");

    if let Commands::Config {
        action: ConfigAction::Show,
    } = &cli.command
    {
        return cmd_config_show(&config, &config_path);
    }

    let orchestrator = open_orchestrator(&config, &cli)?;

    match cli.command {
        Commands::Setup { passphrase } => cmd_setup(&orchestrator, passphrase).await,
        Commands::Backup {
            incremental,
            to,
            passphrase,
        } => cmd_backup(&orchestrator, incremental, to, passphrase).await,
        Commands::Restore {
            backup_id,
            from,
            out,
            passphrase,
        } => {
            let out = out.or_else(|| cli.messages.clone()).context(
                "nowhere to write restored messages: pass --out or --messages",
            )?;
            cmd_restore(&orchestrator, backup_id, from, &out, passphrase).await
        }
        Commands::History {
            remote,
            destination,
            json,
        } => cmd_history(&orchestrator, remote, destination, json).await,
        Commands::Delete {
            backup_id,
            destination,
        } => {
            let destination = destination.unwrap_or_else(|| orchestrator.settings().destination);
            let deleted = orchestrator.delete_backup(&destination, &backup_id).await?;
            print_deleted(&deleted);
            Ok(())
        }
        Commands::DeleteAll { destination, yes } => {
            let destination = destination.unwrap_or_else(|| orchestrator.settings().destination);
            if !yes && !confirm(&format!("Delete every backup at {destination}?"))? {
                println!("aborted");
                return Ok(());
            }
            let deleted = orchestrator.delete_all_backups(&destination).await?;
            print_deleted(&deleted);
            Ok(())
        }
        Commands::Prune { keep, destination } => {
            let destination = destination.unwrap_or_else(|| orchestrator.settings().destination);
            let deleted = orchestrator.prune_backups(&destination, keep).await?;
            print_deleted(&deleted);
            Ok(())
        }
        Commands::Rotate {
            old_passphrase,
            passphrase,
            destination,
        } => cmd_rotate(&orchestrator, old_passphrase, passphrase, destination).await,
        Commands::SetDestination {
            destination,
            passphrase,
        } => cmd_set_destination(&orchestrator, destination, passphrase).await,
        Commands::AcknowledgeRisk { destination, yes } => {
            cmd_acknowledge_risk(&orchestrator, &destination, yes)
        }
        Commands::Enable => {
            orchestrator.set_enabled(true)?;
            println!("backups enabled");
            Ok(())
        }
        Commands::Disable => {
            orchestrator.set_enabled(false)?;
            println!("backups disabled");
            Ok(())
        }
        Commands::Activity { limit } => cmd_activity(&orchestrator, limit),
        Commands::Health { destination } => {
            let destination = destination.unwrap_or_else(|| orchestrator.settings().destination);
            orchestrator
                .check_destination(&destination)
                .await
                .with_context(|| format!("{destination} is not reachable"))?;
            println!("{destination}: ok");
            Ok(())
        }
        Commands::AutoStatus { wifi } => {
            orchestrator.set_auto_backup(AutoBackupPolicy::from_config(&config.auto_backup));
            let due = orchestrator.auto_backup_due(now_millis(), wifi);
            println!("auto-backup due: {}", if due { "yes" } else { "no" });
            Ok(())
        }
        Commands::Config { .. } => unreachable!("handled before the orchestrator is built"),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// Ledger, message store and every destination the environment can reach
fn open_orchestrator(config: &ChatvaultConfig, cli: &Cli) -> Result<BackupOrchestrator> {
    let state_path = cli
        .state
        .as_deref()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| expand_tilde(&config.account.state_file));
    let ledger = Ledger::open(&state_path)
        .with_context(|| format!("opening ledger: {}", state_path.display()))?;

    let source: Arc<dyn MessageSource> = match &cli.messages {
        Some(path) => Arc::new(JsonlFileSource::new(path.clone())),
        None => Arc::new(StaticSource::new(Vec::new())),
    };
    let orchestrator = BackupOrchestrator::new(config, ledger, source);
    let account = &config.account.account_id;

    match S3Credentials::from_env() {
        Ok(creds) => {
            let adapter = OurServersAdapter::from_config(&config.storage, &creds, account)
                .context("building our-servers adapter")?;
            orchestrator.register_adapter(Arc::new(adapter));
        }
        Err(e) => warn!(error = %e, "our servers unavailable: no S3 credentials"),
    }
    match ThirdPartyAdapter::from_config(&config.third_party, account) {
        Ok(adapter) => orchestrator.register_adapter(Arc::new(adapter)),
        Err(e) => debug!(error = %e, "third-party destination not configured"),
    }
    Ok(orchestrator)
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

// ── Secrets and prompts ──────────────────────────────────────────────────────

fn secret_from(value: String, passphrase: bool) -> BackupSecret {
    if passphrase {
        BackupSecret::passphrase(value)
    } else {
        BackupSecret::pin(value)
    }
}

fn kind_label(passphrase: bool) -> &'static str {
    if passphrase {
        "passphrase"
    } else {
        "PIN"
    }
}

/// CHATVAULT_SECRET, or a hidden prompt
fn read_secret(passphrase: bool) -> Result<BackupSecret> {
    if let Ok(value) = std::env::var("CHATVAULT_SECRET") {
        return Ok(secret_from(value, passphrase));
    }
    let value = rpassword::prompt_password(format!("Backup {}: ", kind_label(passphrase)))
        .context("reading secret")?;
    Ok(secret_from(value, passphrase))
}

/// A new secret, entered twice. `env` names the variable that skips the prompt.
fn read_new_secret(passphrase: bool, env: &str) -> Result<BackupSecret> {
    if let Ok(value) = std::env::var(env) {
        return Ok(secret_from(value, passphrase));
    }
    let label = kind_label(passphrase);
    let first = rpassword::prompt_password(format!("New backup {label}: "))
        .context("reading secret")?;
    let second = rpassword::prompt_password(format!("Confirm backup {label}: "))
        .context("reading secret")?;
    if first != second {
        anyhow::bail!("the two entries do not match");
    }
    Ok(secret_from(first, passphrase))
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush().context("flushing stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("reading answer")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

// ── Progress ──────────────────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Progress callback driving `pb`: stage names, then a bar once chunks flow
fn progress_for(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Arc::new(move |event: &ProgressEvent| match event {
        ProgressEvent::Stage(stage) => pb.set_message(stage.to_string()),
        ProgressEvent::ChunkUploaded { index, total, .. }
        | ProgressEvent::ChunkRestored { index, total, .. } => {
            if pb.length() != Some(*total as u64) {
                if let Ok(style) = ProgressStyle::with_template(
                    "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                ) {
                    pb.set_style(style.progress_chars("=>-"));
                }
                pb.set_length(*total as u64);
            }
            pb.set_position(*index as u64);
        }
    })
}

/// Cancel the run on Ctrl-C, then wait for it to unwind.
async fn join_with_ctrl_c<T: Send + 'static>(task: BackupTask<T>) -> Result<T> {
    let token = task.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancelling...");
            token.cancel();
        }
    });
    let result = task.join().await;
    watcher.abort();
    Ok(result?)
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_setup(orchestrator: &BackupOrchestrator, passphrase: bool) -> Result<()> {
    let secret = read_new_secret(passphrase, "CHATVAULT_SECRET")?;
    let pb = make_progress_bar("setup");
    pb.set_message("deriving key");
    let result = orchestrator.setup_secret(secret).await;
    pb.finish_and_clear();
    let record = result?;

    println!("Backup key set up:");
    println!("  key id:      {}", record.key_id);
    println!("  destination: {}", orchestrator.settings().destination);
    Ok(())
}

async fn cmd_backup(
    orchestrator: &BackupOrchestrator,
    incremental: bool,
    to: Option<BackupDestination>,
    passphrase: bool,
) -> Result<()> {
    let secret = read_secret(passphrase)?;
    let backup_type = if incremental {
        BackupType::Incremental
    } else {
        BackupType::Full
    };
    let pb = make_progress_bar("backup");
    let mut request = BackupRequest::new(secret, backup_type).with_progress(progress_for(&pb));
    if let Some(destination) = to {
        request = request.to(destination);
    }

    let task = orchestrator.spawn_backup(request)?;
    let result = join_with_ctrl_c(task).await;
    pb.finish_and_clear();
    let entry = result?;
    info!(backup_id = %entry.backup_id, "backup stored");

    println!("Backup complete:");
    println!("  id:       {}", entry.backup_id);
    println!("  type:     {}", entry.backup_type);
    if let Some(parent) = entry.parent_id {
        println!("  parent:   {parent}");
    }
    println!("  messages: {}", entry.message_count);
    println!("  chunks:   {}", entry.chunk_count);
    println!("  bytes:    {}", fmt_bytes(entry.byte_size));
    println!("  stored:   {}", entry.destination);
    Ok(())
}

async fn cmd_restore(
    orchestrator: &BackupOrchestrator,
    backup_id: BackupId,
    from: Option<BackupDestination>,
    out: &Path,
    passphrase: bool,
) -> Result<()> {
    let secret = read_secret(passphrase)?;
    let destination = from.unwrap_or_else(|| orchestrator.settings().destination);
    let pb = make_progress_bar("restore");
    let request =
        RestoreRequest::new(secret, destination, backup_id).with_progress(progress_for(&pb));

    let task = orchestrator.spawn_restore(request)?;
    let result = join_with_ctrl_c(task).await;
    pb.finish_and_clear();
    let messages = result?;

    write_jsonl(out, &messages)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    println!("Restored {} messages → {}", messages.len(), out.display());
    Ok(())
}

async fn cmd_history(
    orchestrator: &BackupOrchestrator,
    remote: bool,
    destination: Option<BackupDestination>,
    json: bool,
) -> Result<()> {
    if remote {
        let destination = destination.unwrap_or_else(|| orchestrator.settings().destination);
        let mut summaries = orchestrator
            .remote_history(&destination)
            .await
            .with_context(|| format!("listing {destination}"))?;
        summaries.sort_by_key(|s| s.created_at);
        if json {
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            return Ok(());
        }
        println!("{} backups at {destination}", summaries.len());
        for s in &summaries {
            println!(
                "  {}  {:<11}  {:>6} msgs  {:>9}  {}",
                s.backup_id,
                s.backup_type,
                s.message_count,
                fmt_bytes(s.byte_size),
                s.parent_id.map(|p| format!("← {p}")).unwrap_or_default(),
            );
        }
        return Ok(());
    }

    let mut entries = orchestrator.history();
    if let Some(destination) = &destination {
        entries.retain(|e| &e.destination == destination);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("no backups yet");
        return Ok(());
    }
    for e in &entries {
        println!(
            "  {}  {:<11}  {:>6} msgs  {:>9}  {}  {}",
            e.backup_id,
            e.backup_type,
            e.message_count,
            fmt_bytes(e.byte_size),
            e.destination,
            e.parent_id.map(|p| format!("← {p}")).unwrap_or_default(),
        );
    }
    Ok(())
}

fn print_deleted(deleted: &[BackupId]) {
    if deleted.is_empty() {
        println!("nothing to delete");
        return;
    }
    println!("Deleted {} backups:", deleted.len());
    for id in deleted {
        println!("  {id}");
    }
}

async fn cmd_rotate(
    orchestrator: &BackupOrchestrator,
    old_passphrase: bool,
    passphrase: bool,
    destination: Option<BackupDestination>,
) -> Result<()> {
    let old = read_secret(old_passphrase)?;
    let new = read_new_secret(passphrase, "CHATVAULT_NEW_SECRET")?;
    let destination = destination.unwrap_or_else(|| orchestrator.settings().destination);

    let pb = make_progress_bar("rotate");
    let cancel = cancel_on_ctrl_c();
    let result = orchestrator
        .rotate_secret(old, new, destination, cancel)
        .await;
    pb.finish_and_clear();
    let entry = result?;

    println!("Backup {} changed:", kind_label(passphrase));
    println!("  key id:   {}", entry.key_id);
    println!("  backup:   {}", entry.backup_id);
    println!("  messages: {}", entry.message_count);
    println!("Older backups remain encrypted under the previous secret until deleted.");
    Ok(())
}

async fn cmd_set_destination(
    orchestrator: &BackupOrchestrator,
    destination: BackupDestination,
    passphrase: bool,
) -> Result<()> {
    if orchestrator.settings().destination == destination {
        println!("{destination} is already selected");
        return Ok(());
    }
    let secret = if orchestrator.current_key().is_some() {
        read_secret(passphrase)?
    } else {
        // Nothing to migrate; the secret is never used.
        secret_from(String::new(), passphrase)
    };

    let pb = make_progress_bar("migrate");
    let cancel = cancel_on_ctrl_c();
    let result = orchestrator
        .change_destination(secret, destination.clone(), cancel)
        .await;
    pb.finish_and_clear();

    match result? {
        Some(entry) => println!(
            "Backups moved to {destination} ({} messages, backup {})",
            entry.message_count, entry.backup_id
        ),
        None => println!("Backups will go to {destination}"),
    }
    Ok(())
}

fn cmd_acknowledge_risk(
    orchestrator: &BackupOrchestrator,
    destination: &BackupDestination,
    yes: bool,
) -> Result<()> {
    let Some(notice) = destination.risk_notice() else {
        println!("{destination} needs no acknowledgement");
        return Ok(());
    };
    println!("{notice}");
    println!();
    if !yes && !confirm("Use this destination anyway?")? {
        println!("not acknowledged");
        return Ok(());
    }
    orchestrator.acknowledge_third_party_risk(destination)?;
    println!("acknowledged {destination}");
    Ok(())
}

fn cmd_activity(orchestrator: &BackupOrchestrator, limit: usize) -> Result<()> {
    let activity = orchestrator.activity();
    let skip = activity.len().saturating_sub(limit);
    for entry in activity.iter().skip(skip) {
        let status = if entry.success { "ok  " } else { "FAIL" };
        let destination = entry
            .destination
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  {status}  {:<9}  {:<20}  {}",
            entry.at,
            entry.operation,
            destination,
            entry.detail.as_deref().unwrap_or(""),
        );
    }
    if let RunState::Failed(reason) = orchestrator.stage() {
        debug!(%reason, "last run failed");
    }
    Ok(())
}

fn cmd_config_show(config: &ChatvaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config")?;
    print!("{rendered}");
    Ok(())
}

/// A token cancelled by Ctrl-C, for runs awaited in place
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancelling...");
            child.cancel();
        }
    });
    token
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
