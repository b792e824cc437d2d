// src/main.rs — agentforge entry point

use clap::Parser;

use agentforge::cli::run::RunOptions;
use agentforge::cli::{Cli, Commands};
use agentforge::infra::config::Config;
use agentforge::infra::logger;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG; -v flags raise the default
    logger::init_logging(logger::level_for_verbosity(cli.verbose));

    // Falls back to defaults if no config.toml
    let config = if let Some(ref path) = cli.config {
        Config::load_from(path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Commands::Run {
            goal,
            stack,
            budget,
            approve_plan,
            approve_steps,
            workspace,
            json,
        } => {
            let goal = goal.join(" ");
            let opts = RunOptions {
                budget,
                approve_plan,
                approve_steps,
                workspace,
                json,
                quiet: cli.quiet,
            };
            agentforge::cli::run::run_goal(&goal, &stack, opts, &config).await
        }
        Commands::Resume { run_id, json } => {
            agentforge::cli::run::resume_run(&run_id, json, cli.quiet, &config).await
        }
        Commands::Status { run_id, full } => {
            agentforge::cli::status::show_status(&run_id, full).await
        }
        Commands::Runs { limit } => agentforge::cli::status::list_runs(limit).await,
        Commands::Cache { action } => agentforge::cli::cache::run_cache(action, &config).await,
    }
}
