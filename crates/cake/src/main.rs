//! CAKE CLI — supervise an agent, query the policy engine, inspect state.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use cake_core::audit::AuditLog;
use cake_core::config::{CakeConfig, ConfigHandle};
use cake_core::interceptor::{CommandInterceptor, CommandRequest, SupervisionMode};
use cake_core::logging::init_logging;
use cake_core::recall::RecallStore;
use cake_core::runtime::run_supervised;
use cake_core::snapshots::SnapshotManager;

#[derive(Parser)]
#[command(name = "cake", version, about = "Operator-in-the-loop supervisor for AI coding agents")]
struct Cli {
    /// Path to cake.toml (defaults apply when absent)
    #[arg(long, global = true, env = "CAKE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise an agent command until it exits
    Watch {
        /// Repository root snapshots are taken from (defaults to cwd)
        #[arg(long)]
        repo: Option<PathBuf>,
        /// The agent command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Evaluate one command line through the policy engine
    Decide {
        /// The command line to evaluate
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Inspect the recall store
    Recall {
        #[command(subcommand)]
        action: RecallAction,
    },
    /// Manage repository snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Show the tail of the command audit log
    Audit {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Validate a configuration file
    Config {
        /// File to validate (defaults to --config)
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RecallAction {
    /// Record counts and degradation state
    Stats,
    /// Remove expired records now
    Purge,
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List snapshots, oldest first
    List,
    /// Capture a snapshot of the repository at --repo (or cwd)
    Create {
        #[arg(long, default_value = "manual")]
        label: String,
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Restore a snapshot by id
    Restore {
        id: uuid::Uuid,
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Apply age and size caps now
    Gc {
        #[arg(long)]
        repo: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CakeConfig> {
    match path {
        Some(path) => CakeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(CakeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_logging(&config.logging).ok();

    match cli.command {
        Commands::Watch { repo, command } => {
            let repo = repo.unwrap_or(std::env::current_dir()?);
            let handle = ConfigHandle::new(config);
            let code = run_supervised(handle, &command, repo, cli.config).await?;
            std::process::exit(code);
        }
        Commands::Decide { command } => {
            let audit = AuditLog::open(config.audit_log_path())
                .context("opening audit log (is another cake process running?)")?;
            let interceptor = CommandInterceptor::new(&config.safety, audit);
            let request =
                CommandRequest::from_line(&command.join(" "), std::env::current_dir()?);
            let decision = interceptor.decide(&request, SupervisionMode::Normal);
            println!("{}", serde_json::to_string_pretty(&decision)?);
            if !decision.allowed {
                std::process::exit(1);
            }
        }
        Commands::Recall { action } => {
            let store =
                RecallStore::open(config.recall_db_path(), config.recall_ttl()).await?;
            match action {
                RecallAction::Stats => {
                    let stats = store.stats().await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                RecallAction::Purge => {
                    let removed = store.purge_expired().await?;
                    println!("purged {removed} expired record(s)");
                }
            }
        }
        Commands::Snapshot { action } => {
            let repo_of = |repo: Option<PathBuf>| -> anyhow::Result<PathBuf> {
                Ok(repo.unwrap_or(std::env::current_dir()?))
            };
            match action {
                SnapshotAction::List => {
                    let manager =
                        SnapshotManager::new(std::env::current_dir()?, config.snapshot_dir());
                    for snapshot in manager.list().await? {
                        println!(
                            "{}  {}  {}  {} file(s)  {} bytes",
                            snapshot.id,
                            snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                            snapshot.label,
                            snapshot.stashed.len(),
                            snapshot.bytes,
                        );
                    }
                }
                SnapshotAction::Create { label, repo } => {
                    let manager =
                        SnapshotManager::new(repo_of(repo)?, config.snapshot_dir());
                    let snapshot = manager.create(&label, None).await?;
                    println!("{}", snapshot.id);
                }
                SnapshotAction::Restore { id, repo } => {
                    let manager =
                        SnapshotManager::new(repo_of(repo)?, config.snapshot_dir());
                    manager.restore(id).await?;
                    println!("restored {id}");
                }
                SnapshotAction::Gc { repo } => {
                    let manager =
                        SnapshotManager::new(repo_of(repo)?, config.snapshot_dir());
                    let retention =
                        Duration::from_secs(config.snapshot.retention_hours * 3600);
                    let cap = config.snapshot.max_size_gb * 1024 * 1024 * 1024;
                    let removed = manager.gc(retention, cap, &HashSet::new()).await?;
                    println!("removed {removed} snapshot(s)");
                }
            }
        }
        Commands::Audit { limit } => {
            let path = config.audit_log_path();
            if !path.exists() {
                bail!("no audit log at {}", path.display());
            }
            for entry in AuditLog::read_tail(&path, limit)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Commands::Config { path } => {
            let target = path.or(cli.config);
            let Some(target) = target else {
                bail!("no config file given; pass a path or --config");
            };
            match CakeConfig::load(&target) {
                Ok(_) => println!("ok: {}", target.display()),
                Err(e) => {
                    eprintln!("invalid: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}
