//! Progress-gated workflow orchestrator for coding agents.
//!
//! Runs benchmark tasks through planned workflows (`run-task`, `run-suite`,
//! `resume-run`, `inspect-run`) and drives parallel self-improvement sessions
//! against a master checkout (`self-improve`).

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use flowgate::cli;
use flowgate::exit_codes;
use flowgate::io::config::{DEFAULT_CONFIG_FILE, FlowConfig, ProviderKind, load_config};
use flowgate::logging;

#[derive(Parser)]
#[command(
    name = "flowgate",
    version,
    about = "Progress-gated workflow orchestrator for coding agents"
)]
struct Cli {
    /// Config file (missing file means defaults).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Override the configured provider kind.
    #[arg(long, global = true, value_enum)]
    provider: Option<ProviderKind>,
    /// Override the configured runs directory.
    #[arg(long, global = true)]
    runs_dir: Option<PathBuf>,
    /// Override the configured tasks directory.
    #[arg(long, global = true)]
    tasks_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one benchmark task in a fresh run directory.
    RunTask { task_id: String },
    /// Run every task under the tasks directory.
    RunSuite,
    /// Continue an interrupted run from its workflow state.
    ResumeRun { run_dir: PathBuf },
    /// Print a run's manifest and per-step status.
    InspectRun { run_dir: PathBuf },
    /// Run parallel improvement sessions against a master checkout.
    SelfImprove {
        goal: String,
        /// File path, URL or inline text giving the goal context.
        #[arg(long)]
        input: Option<String>,
        /// Master checkout to improve.
        #[arg(long, default_value = ".")]
        master: PathBuf,
        #[arg(long)]
        sessions: Option<usize>,
        #[arg(long)]
        batches: Option<usize>,
        #[arg(long)]
        max_workers: Option<usize>,
        /// Record the winner without merging it.
        #[arg(long)]
        no_merge: bool,
    },
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn load(args: &Cli) -> Result<FlowConfig> {
    let mut config = load_config(&args.config)?;
    if let Some(kind) = args.provider {
        config.provider.kind = kind;
    }
    if let Some(runs_dir) = &args.runs_dir {
        config.runs_dir = runs_dir.clone();
    }
    if let Some(tasks_dir) = &args.tasks_dir {
        config.tasks_dir = tasks_dir.clone();
    }
    Ok(config)
}

fn run(args: Cli) -> Result<i32> {
    let mut config = load(&args)?;
    match &args.command {
        Command::RunTask { task_id } => cli::cmd_run_task(&config, task_id),
        Command::RunSuite => cli::cmd_run_suite(&config),
        Command::ResumeRun { run_dir } => cli::cmd_resume_run(&config, run_dir),
        Command::InspectRun { run_dir } => cli::cmd_inspect_run(run_dir),
        Command::SelfImprove {
            goal,
            input,
            master,
            sessions,
            batches,
            max_workers,
            no_merge,
        } => {
            let settings = &mut config.self_improve;
            if let Some(sessions) = sessions {
                settings.sessions_per_batch = *sessions;
            }
            if let Some(batches) = batches {
                settings.batches = *batches;
            }
            if let Some(max_workers) = max_workers {
                settings.max_workers = *max_workers;
            }
            if *no_merge {
                settings.merge_on_success = false;
            }
            config.validate()?;
            cli::cmd_self_improve(&config, master, goal, input.as_deref())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_task() {
        let cli = Cli::parse_from(["flowgate", "run-task", "01-add", "--provider", "mock"]);
        assert!(matches!(cli.command, Command::RunTask { ref task_id } if task_id == "01-add"));
        assert_eq!(cli.provider, Some(ProviderKind::Mock));
    }

    #[test]
    fn parse_self_improve_overrides() {
        let cli = Cli::parse_from([
            "flowgate",
            "self-improve",
            "Fix the add function",
            "--sessions",
            "3",
            "--no-merge",
        ]);
        match cli.command {
            Command::SelfImprove {
                goal,
                sessions,
                no_merge,
                master,
                ..
            } => {
                assert_eq!(goal, "Fix the add function");
                assert_eq!(sessions, Some(3));
                assert!(no_merge);
                assert_eq!(master, PathBuf::from("."));
            }
            _ => panic!("expected self-improve"),
        }
    }
}
