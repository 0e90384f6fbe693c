//! Hostwarden - host integrity and service watchdog agent for Linux servers
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon
//! sudo hostwarden start
//!
//! # Watch a directory for content changes
//! sudo hostwarden config add paths "/etc/nginx hash"
//!
//! # Check status
//! sudo hostwarden status
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use hostwarden::daemon::{self, Command, Response};
use hostwarden::detector::integrity::IntegrityEngine;
use hostwarden::{
    backup, Agent, Config, ConfigEdit, ConfigStore, EngineKind, Event, EventKind, EventLog, Section, SystemPlatform,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "hostwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hostwarden/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Hostwarden daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the Hostwarden daemon
    Stop,

    /// Restart the Hostwarden daemon
    Restart,

    /// Check daemon status
    Status,

    /// Control a single engine of the running daemon
    Engine {
        #[command(subcommand)]
        action: EngineAction,
    },

    /// Run one integrity cycle and print its events
    Check,

    /// Run one watchdog cycle and print its events
    Services,

    /// Run one content scan and print its findings
    Scan,

    /// Record current hashes of hash-mode paths as the baseline
    Baseline,

    /// Policy management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show scanner findings of the running daemon
    Findings {
        /// Forget all findings
        #[arg(long)]
        clear: bool,
    },

    /// Lift restart suppression for a flapping service
    ClearService {
        /// Service unit name
        name: String,
    },

    /// Directory backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// View the security event log
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },
}

#[derive(Subcommand)]
enum EngineAction {
    /// Start the engine loop
    Start { engine: EngineKind },

    /// Stop the engine loop, leaving the others running
    Stop { engine: EngineKind },

    /// Run a cycle now
    Run { engine: EngineKind },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default agent configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the agent configuration, or one policy section
    Show { section: Option<Section> },

    /// Append an entry to a section
    Add { section: Section, line: String },

    /// Overwrite the entry at a 1-based position
    Set {
        section: Section,
        index: usize,
        line: String,
    },

    /// Remove the entry at a 1-based position
    Remove { section: Section, index: usize },

    /// Replace a whole section
    Replace { section: Section, lines: Vec<String> },

    /// Replace or add one pattern category
    Category { name: String, keywords: Vec<String> },

    /// Remove one pattern category
    RemoveCategory { name: String },

    /// Re-read a policy file edited by hand
    Reload { section: Section },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Archive a directory
    Create { source: PathBuf },

    /// Unpack an archive into a directory
    Restore { archive: PathBuf, dest: PathBuf },

    /// List recorded backups
    List,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) if cli.config.exists() => {
            eprintln!("Failed to load config {:?}: {}", cli.config, e);
            std::process::exit(1);
        }
        Err(_) => Config::default(),
    };

    // Forking is only safe before the runtime spawns its threads
    if let Commands::Start { foreground: false } = cli.command {
        if daemon::is_running(&config) {
            anyhow::bail!("Hostwarden is already running");
        }
        daemon::daemonize(&config)?;
    }

    setup_logging(cli.verbose);
    if !cli.config.exists() {
        info!("Using default configuration");
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(cli.command, config, cli.config));
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn run(command: Commands, config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    match command {
        Commands::Start { .. } => {
            info!("Starting Hostwarden daemon...");
            daemon::start(config).await?;
        }

        Commands::Stop => {
            info!("Stopping Hostwarden daemon...");
            daemon::stop(&config).await?;
        }

        Commands::Restart => {
            info!("Restarting Hostwarden daemon...");
            daemon::stop(&config).await?;
            daemon::start(config).await?;
        }

        Commands::Status => {
            daemon::status(&config).await?;
        }

        Commands::Engine { action } => {
            let cmd = match action {
                EngineAction::Start { engine } => Command::EngineStart(engine),
                EngineAction::Stop { engine } => Command::EngineStop(engine),
                EngineAction::Run { engine } => Command::EngineRun(engine),
            };
            request(&config, cmd).await?;
        }

        Commands::Check => one_shot(config, EngineKind::Integrity).await?,
        Commands::Services => one_shot(config, EngineKind::Watchdog).await?,
        Commands::Scan => {
            let agent = Agent::new(config)?;
            agent.coordinator().run_once(EngineKind::Scanner).await;
            daemon::print_findings(&agent.findings().list());
        }

        Commands::Baseline => {
            // The daemon's integrity engine owns the baseline file
            daemon::ensure_stopped(&config, "record a baseline")?;
            info!("Creating baseline...");
            let store = load_store(&config)?;
            let mut engine = IntegrityEngine::new(config.integrity.clone(), Arc::new(SystemPlatform::new()));
            let count = engine.prime(&store.snapshot()).await;
            println!("Baseline recorded for {} files", count);
        }

        Commands::Config {
            action: ConfigAction::Init { force },
        } => {
            if config_path.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", config_path);
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }

        Commands::Config { action } => config_command(&config, action).await?,

        Commands::Findings { clear } => {
            let cmd = if clear { Command::ClearFindings } else { Command::Findings };
            request(&config, cmd).await?;
        }

        Commands::ClearService { name } => {
            request(&config, Command::ClearService(name)).await?;
        }

        Commands::Backup { action } => {
            let platform = SystemPlatform::new();
            match action {
                BackupAction::Create { source } => {
                    let record =
                        backup::create(&platform, &source, &config.backup.archive_dir, &config.backup.ledger)
                            .await?;
                    println!("Created {}", record.archive.display());
                }
                BackupAction::Restore { archive, dest } => {
                    backup::restore(&platform, &archive, &dest).await?;
                    println!("Restored {} to {}", archive.display(), dest.display());
                }
                BackupAction::List => {
                    for record in backup::list(&config.backup.ledger)? {
                        println!(
                            "{}  {}  {}",
                            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            record.source.display(),
                            record.archive.display()
                        );
                    }
                }
            }
        }

        Commands::Logs { lines, follow } => {
            daemon::show_logs(&config, lines, follow).await?;
        }
    }

    Ok(())
}

/// Run a single cycle of one engine without a daemon
async fn one_shot(config: Config, kind: EngineKind) -> anyhow::Result<()> {
    info!("Running {} cycle...", kind);
    let agent = Agent::new(config)?;
    let events = agent.coordinator().run_once(kind).await.unwrap_or_default();
    daemon::print_events(&events);
    Ok(())
}

fn load_store(config: &Config) -> anyhow::Result<ConfigStore> {
    ConfigStore::load(config.policy.clone(), config.integrity.default_mode).context("Failed to load policy")
}

/// Send a command to the daemon, failing if it answers with an error
async fn request(config: &Config, cmd: Command) -> anyhow::Result<()> {
    if !daemon::is_running(config) {
        anyhow::bail!("Hostwarden is not running");
    }
    match daemon::send_command(config, cmd).await? {
        Response::Error(e) => anyhow::bail!(e),
        response => daemon::print_response(&response),
    }
    Ok(())
}

async fn config_command(config: &Config, action: ConfigAction) -> anyhow::Result<()> {
    let edit = match action {
        ConfigAction::Init { .. } => unreachable!("handled before policy commands"),
        ConfigAction::Show { section: None } => {
            println!("{}", serde_yaml::to_string(config)?);
            return Ok(());
        }
        ConfigAction::Show { section: Some(section) } => {
            let store = load_store(config)?;
            for (index, line) in store.snapshot().lines(section).iter().enumerate() {
                println!("{:>4}  {}", index + 1, line);
            }
            return Ok(());
        }
        ConfigAction::Reload { section } => {
            return request(config, Command::Reload(section)).await;
        }
        ConfigAction::Add { section, line } => ConfigEdit::Add { section, line },
        ConfigAction::Set { section, index, line } => ConfigEdit::Set {
            section,
            index: position(index)?,
            line,
        },
        ConfigAction::Remove { section, index } => ConfigEdit::Remove {
            section,
            index: position(index)?,
        },
        ConfigAction::Replace { section, lines } => ConfigEdit::Replace { section, lines },
        ConfigAction::Category { name, keywords } => ConfigEdit::ReplaceCategory {
            category: name,
            keywords,
        },
        ConfigAction::RemoveCategory { name } => ConfigEdit::RemoveCategory { category: name },
    };

    // A running daemon applies the edit itself so the affected engine wakes
    if daemon::is_running(config) {
        return request(config, Command::Edit(edit)).await;
    }

    let policy = load_store(config)?.apply_edit(&edit)?;
    let event = Event::new(
        EventKind::ConfigUpdated,
        edit.section().as_str(),
        format!("policy revision {}", policy.revision),
    );
    match EventLog::open(&config.daemon.event_log, config.alerts.clone()) {
        Ok(log) => log.record(&event),
        Err(e) => warn!("Cannot open event log {:?}: {}", config.daemon.event_log, e),
    }
    println!("Policy updated (revision {})", policy.revision);
    Ok(())
}

/// Entry positions are 1-based on the command line
fn position(index: usize) -> anyhow::Result<usize> {
    index
        .checked_sub(1)
        .ok_or_else(|| anyhow::anyhow!("entry positions start at 1"))
}
