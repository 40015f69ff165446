//! pipeforge CLI surface.
//!
//! Thin wrappers over the engine facade: `serve` boots the orchestrator
//! worker and logs bus events, `start` submits a pipeline from a JSON
//! file and optionally waits for it. The richer API/TUI front-ends live
//! outside this crate.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// pipeforge: run multi-step AI agent pipelines over git worktrees.
#[derive(Debug, Parser)]
#[command(name = "pipeforge", version, about)]
pub struct Cli {
    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the orchestrator worker and log engine events.
    Serve {
        /// Use the in-memory store instead of PostgreSQL.
        #[arg(long)]
        memory: bool,
    },

    /// Submit a pipeline run.
    Start {
        /// Project id the run belongs to.
        #[arg(long)]
        project_id: String,

        /// Repository path; registers/updates the project when given.
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Pipeline definition JSON file.
        #[arg(long)]
        file: PathBuf,

        /// Caller-supplied run id (enables replay detection).
        #[arg(long)]
        run_id: Option<String>,

        /// Base commit; repository HEAD when omitted.
        #[arg(long)]
        base_commit: Option<String>,

        /// Fork from this previous run.
        #[arg(long)]
        fork_from: Option<String>,

        /// Last inherited step id of the fork.
        #[arg(long)]
        fork_after: Option<String>,

        /// Disable the automatic fork scan.
        #[arg(long)]
        no_auto_fork: bool,

        /// Use the in-memory store instead of PostgreSQL.
        #[arg(long)]
        memory: bool,

        /// Wait for the run and print a summary.
        #[arg(long)]
        wait: bool,
    },
}

/// Parses the process arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Dispatches a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { memory } => commands::serve(memory).await,
        Commands::Start {
            project_id,
            repo,
            file,
            run_id,
            base_commit,
            fork_from,
            fork_after,
            no_auto_fork,
            memory,
            wait,
        } => {
            commands::start(commands::StartArgs {
                project_id,
                repo,
                file,
                run_id,
                base_commit,
                fork_from,
                fork_after,
                no_auto_fork,
                memory,
                wait,
            })
            .await
        }
    }
}
