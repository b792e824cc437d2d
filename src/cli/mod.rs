// src/cli/mod.rs — CLI definition (clap derive)

pub mod approval;
pub mod cache;
pub mod progress;
pub mod run;
pub mod status;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "agentforge",
    about = "Budgeted planner/developer/reviewer code generation",
    version
)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress progress output (only emit the final summary)
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan, implement and review a goal in a fresh workspace
    Run {
        /// What to build
        #[arg(trailing_var_arg = true, required = true)]
        goal: Vec<String>,

        /// Project stack (python, node, react, vue, laravel, rust, go)
        #[arg(short, long)]
        stack: String,

        /// Spending cap for this run (defaults to the daily budget)
        #[arg(short, long)]
        budget: Option<f64>,

        /// Pause for approval once the plan is ready
        #[arg(long)]
        approve_plan: bool,

        /// Pause for approval after every accepted step
        #[arg(long)]
        approve_steps: bool,

        /// Use an existing directory instead of a new per-run workspace
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Print the final summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Continue an interrupted run
    Resume {
        run_id: String,

        #[arg(long)]
        json: bool,
    },
    /// Show a run with its steps and conversation log
    Status {
        run_id: String,

        /// Include full agent payloads
        #[arg(long)]
        full: bool,
    },
    /// List recent runs
    Runs {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Inspect or wipe the prompt cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheAction {
    /// Entry counts, reuse and estimated savings
    Stats,
    /// Remove every persisted entry
    Clear,
}
