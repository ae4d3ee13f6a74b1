use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use anvil::logging::{self, LogFormat, LoggingOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Autonomous work loop with evidence-gated commits")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, env = "ANVIL_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    /// Log format for stderr diagnostics
    #[arg(long, global = true, value_enum, default_value = "compact")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize .anvil/ in the project
    Init {
        /// Overwrite an existing anvil.toml
        #[arg(long)]
        force: bool,
    },
    /// Add, import, and inspect work items
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Show queue counts
    Status,
    /// Start the worker loop
    Run {
        /// Number of concurrent workers (defaults to [queue].workers)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Process at most one item, then exit
        #[arg(long)]
        once: bool,

        /// Workflow profile (overrides ANVIL_PROFILE and [workflow].profile)
        #[arg(long)]
        profile: Option<String>,
    },
    /// Inspect recorded evidence
    Evidence {
        #[command(subcommand)]
        command: EvidenceCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Serve the read-only status API on localhost
    Serve {
        #[arg(short, long, default_value_t = anvil::api::DEFAULT_PORT)]
        port: u16,
    },
}

#[derive(Subcommand, Clone)]
pub enum QueueCommands {
    /// Add one work item
    Push {
        title: String,

        /// bug_fix, feature, test, refactor, documentation
        #[arg(short = 't', long = "type", default_value = "feature")]
        work_type: String,

        /// 1 (lowest) to 5 (highest)
        #[arg(short, long, default_value = "3")]
        priority: i64,

        #[arg(short, long, default_value = "")]
        description: String,

        #[arg(long, default_value = "manual")]
        source: String,

        /// Files the change is expected to touch (repeatable)
        #[arg(long = "expect")]
        expected_files: Vec<String>,

        /// Environment needs, matched against pre-flight `required_for` (repeatable)
        #[arg(long = "needs")]
        needs: Vec<String>,

        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Import work items from a YAML or JSON file
    Import { file: PathBuf },
    /// List work items
    List {
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short = 't', long = "type")]
        work_type: Option<String>,

        #[arg(long)]
        min_priority: Option<u8>,

        #[arg(long)]
        max_priority: Option<u8>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one work item
    View { id: String },
}

#[derive(Subcommand, Clone)]
pub enum EvidenceCommands {
    /// Export the evidence report for a work item
    Export {
        id: String,

        /// Write the report to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only the long-running commands keep a log file.
    let log_dir = match &cli.command {
        Commands::Run { .. } | Commands::Serve { .. } => Some(project_dir.join(anvil::config::STATE_DIR).join("logs")),
        _ => None,
    }
    .filter(|dir| dir.parent().is_some_and(|p| p.is_dir()));
    let _guard = logging::init(&LoggingOptions {
        format: cli.log_format,
        verbose: cli.verbose,
        log_dir,
    })?;

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Queue { command } => cmd::cmd_queue(&project_dir, command.clone()).await?,
        Commands::Status => cmd::cmd_status(&project_dir).await?,
        Commands::Run {
            workers,
            once,
            profile,
        } => cmd::cmd_run(&project_dir, *workers, *once, profile.clone()).await?,
        Commands::Evidence { command } => cmd::cmd_evidence(&project_dir, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Serve { port } => cmd::cmd_serve(&project_dir, *port).await?,
    }

    Ok(())
}
