//! CLI command implementations.
//!
//! Each command returns the process exit code; errors bubble up to `main`,
//! which maps them to [`exit_codes::INVALID`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::core::workflow::WorkflowStatus;
use crate::execute::WorkflowServices;
use crate::exit_codes;
use crate::io::config::{EvaluationConfig, FlowConfig, ProviderConfig, ProviderKind};
use crate::io::evaluation::{CommandTestRunner, TestRunner};
use crate::io::provider::{CommandProvider, ReasoningProvider, ScriptedProvider};
use crate::self_improve::SelfImprove;
use crate::suite::run_suite;
use crate::task::{TaskRunReport, find_task_dir, inspect_run, resume_run, run_task};

/// Provider for the configured kind, running in `workdir`.
pub fn build_provider(config: &ProviderConfig, workdir: &Path) -> Result<Box<dyn ReasoningProvider>> {
    match config.kind {
        ProviderKind::Command => {
            if config.command.is_empty() {
                bail!("provider.command must be a non-empty array");
            }
            Ok(Box::new(CommandProvider {
                argv: config.command.clone(),
                workdir: workdir.to_path_buf(),
                timeout: Duration::from_secs(config.timeout_secs),
                output_limit_bytes: config.output_limit_bytes,
            }))
        }
        ProviderKind::Mock => Ok(Box::new(ScriptedProvider::default())),
    }
}

pub fn build_test_runner(config: &EvaluationConfig) -> Arc<dyn TestRunner> {
    Arc::new(CommandTestRunner {
        argv: config.command.clone(),
        timeout: Duration::from_secs(config.timeout_secs),
        output_limit_bytes: config.output_limit_bytes,
        log_path: None,
    })
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("resolve current directory")
}

fn print_task_report(report: &TaskRunReport) {
    println!(
        "run-task: task={} run={} status={} success={}",
        report.task_id,
        report.run_id,
        report.workflow_status.as_str(),
        report.success
    );
    if let Some(eval) = &report.evaluation {
        println!(
            "run-task: evaluation ok={} passed={} failed={}",
            eval.ok, eval.passed, eval.failed
        );
    }
    for question in &report.clarifying_questions {
        println!("question: {question}");
    }
    println!("run-task: root={}", report.run_root.display());
}

fn task_exit_code(report: &TaskRunReport) -> i32 {
    if report.success {
        exit_codes::OK
    } else {
        exit_codes::UNSUCCESSFUL
    }
}

pub fn cmd_run_task(config: &FlowConfig, task_id: &str) -> Result<i32> {
    let Some(task_dir) = find_task_dir(&config.tasks_dir, task_id)? else {
        bail!(
            "task {task_id} not found under {}",
            config.tasks_dir.display()
        );
    };
    debug!(task = %task_dir.display(), "task located");
    let provider = build_provider(&config.provider, &current_dir()?)?;
    let services = WorkflowServices {
        provider: provider.as_ref(),
        test_runner: build_test_runner(&config.evaluation),
        workflow: &config.workflow,
    };
    let report = run_task(&task_dir, &config.runs_dir, &services)?;
    print_task_report(&report);
    Ok(task_exit_code(&report))
}

pub fn cmd_run_suite(config: &FlowConfig) -> Result<i32> {
    let provider = build_provider(&config.provider, &current_dir()?)?;
    let services = WorkflowServices {
        provider: provider.as_ref(),
        test_runner: build_test_runner(&config.evaluation),
        workflow: &config.workflow,
    };
    let report = run_suite(&config.tasks_dir, &config.runs_dir, &services)?;
    for entry in &report.tasks {
        match &entry.error {
            Some(error) => println!("run-suite: task={} error={error}", entry.task_id),
            None => println!("run-suite: task={} success={}", entry.task_id, entry.success),
        }
    }
    println!(
        "run-suite: run={} total={} passed={} failed={}",
        report.run_id, report.total, report.passed, report.failed
    );
    Ok(if report.all_passed() {
        exit_codes::OK
    } else {
        exit_codes::UNSUCCESSFUL
    })
}

pub fn cmd_resume_run(config: &FlowConfig, run_dir: &Path) -> Result<i32> {
    let provider = build_provider(&config.provider, &current_dir()?)?;
    let services = WorkflowServices {
        provider: provider.as_ref(),
        test_runner: build_test_runner(&config.evaluation),
        workflow: &config.workflow,
    };
    let report = resume_run(run_dir, &services)?;
    print_task_report(&report);
    Ok(task_exit_code(&report))
}

pub fn cmd_inspect_run(run_dir: &Path) -> Result<i32> {
    let inspection = inspect_run(run_dir)?;
    print!("{}", inspection.render());
    Ok(exit_codes::OK)
}

pub fn cmd_self_improve(
    config: &FlowConfig,
    master: &Path,
    goal: &str,
    input: Option<&str>,
) -> Result<i32> {
    let master = master
        .canonicalize()
        .with_context(|| format!("resolve master {}", master.display()))?;
    let provider_config = config.provider.clone();
    let orchestrator = SelfImprove {
        master,
        runs_dir: config.runs_dir.clone(),
        settings: config.self_improve.clone(),
        workflow: config.workflow.clone(),
        test_runner: build_test_runner(&config.evaluation),
        providers: Box::new(move |_session: &str, workspace: &Path| {
            build_provider(&provider_config, workspace)
        }),
    };
    let report = orchestrator.run(goal, input)?;
    for batch in &report.batches {
        for session in &batch.sessions {
            println!(
                "self-improve: batch={} session={} status={} verified={} attempts={} ({})",
                batch.batch_index,
                session.session_id,
                session.workflow_status.as_str(),
                session.verification_ok,
                session.entrypoint_attempts,
                session.verification_reason
            );
        }
        println!(
            "self-improve: batch={} winner={} merged={} ({})",
            batch.batch_index,
            batch.winner_session_id.as_deref().unwrap_or("none"),
            batch.merged,
            batch.merge_reason
        );
    }
    println!("self-improve: report={}", report.run_root.display());
    let blocked = report.all_blocked();
    let found_winner = report
        .batches
        .iter()
        .any(|batch| batch.winner_session_id.is_some());
    info!(blocked, found_winner, "self-improve finished");
    if blocked {
        let questions = report
            .batches
            .iter()
            .flat_map(|batch| batch.sessions.iter())
            .find(|session| session.workflow_status == WorkflowStatus::Blocked)
            .map(|session| session.clarifying_questions.clone())
            .unwrap_or_default();
        for question in questions {
            println!("question: {question}");
        }
    }
    Ok(if found_winner {
        exit_codes::OK
    } else {
        exit_codes::UNSUCCESSFUL
    })
}
