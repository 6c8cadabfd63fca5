//! `planloop` command line.
//!
//! Runs a decomposed plan (`.planloop/tasks.json`) task by task through an
//! external agent session, validating and committing each result.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use planloop::control::{Collaborators, LoopEvent, RunOptions, RunStop, run_loop};
use planloop::exit_codes;
use planloop::gate::GateOutcome;
use planloop::io::config::load_config;
use planloop::io::cost_ledger::CostLedger;
use planloop::io::git::Git;
use planloop::io::init::{InitOptions, PlanPaths, init_workspace};
use planloop::io::interrupt::{InterruptFlag, install_ctrl_c};
use planloop::io::progress_log::ProgressLog;
use planloop::io::replanner::ReplannerBackend;
use planloop::io::session::CommandSessionRunner;
use planloop::io::task_store::TaskStore;
use planloop::io::validator::CommandValidator;
use planloop::logging;
use planloop::reset::{ResetTarget, reset};
use planloop::status::{
    cost_report, render_cost, render_halt, render_status, status_report, task_log,
};

const TASKS_HINT: &str = r#"add tasks to .planloop/tasks.json, for example:
[
  {"id": "1", "description": "set up the project skeleton", "steps": ["cargo init"]},
  {"id": "1.1", "description": "add CI", "steps": []},
  {"id": "2", "description": "implement the parser", "steps": []}
]"#;

#[derive(Parser)]
#[command(
    name = "planloop",
    version,
    about = "Unattended executor for decomposed project plans"
)]
struct Cli {
    /// Workspace root.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    workspace: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.planloop/` with a default config and an empty task list.
    Init {
        /// Overwrite the existing config with defaults.
        #[arg(short, long)]
        force: bool,
    },
    /// Execute tasks until the list completes or a ceiling is hit.
    Run {
        /// Stop after executing this many tasks.
        #[arg(long)]
        max_tasks: Option<u32>,
    },
    /// Print task states and the next task to run.
    Status,
    /// Return a task (or every task) to pending.
    Reset {
        /// Task to reset. Keeps its retry count.
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        task_id: Option<String>,
        /// Reset every task and clear the progress journal.
        #[arg(long)]
        all: bool,
    },
    /// Print the persisted cost history summary.
    Cost,
    /// Print the tail of a task's session and validation logs.
    Log {
        task_id: String,
        /// Lines to show per log file.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::path::absolute(&cli.workspace)
        .with_context(|| format!("resolve workspace {}", cli.workspace.display()))?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run { max_tasks } => cmd_run(&root, max_tasks),
        Command::Status => {
            print!("{}", render_status(&status_report(&root)?));
            Ok(exit_codes::OK)
        }
        Command::Reset { task_id, all } => {
            let target = match task_id {
                Some(id) if !all => ResetTarget::Task(id),
                _ => ResetTarget::All,
            };
            reset(&root, &target)?;
            match target {
                ResetTarget::Task(id) => println!("task {id} reset to pending"),
                ResetTarget::All => println!("all tasks reset to pending"),
            }
            Ok(exit_codes::OK)
        }
        Command::Cost => {
            print!("{}", render_cost(&cost_report(&root)?));
            Ok(exit_codes::OK)
        }
        Command::Log { task_id, lines } => {
            print!("{}", task_log(&root, &task_id, lines)?);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let outcome = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", outcome.paths.state_dir.display());
    if outcome.created_repo {
        println!("created git repository with an initial snapshot");
    }
    if outcome.created_tasks {
        println!("{TASKS_HINT}");
    }
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, max_tasks: Option<u32>) -> Result<i32> {
    let paths = PlanPaths::new(root);
    if !paths.tasks_path.exists() {
        bail!(
            "no task list at {} (run `planloop init` first)",
            paths.tasks_path.display()
        );
    }
    let config = load_config(&paths.config_path)?;
    let mut store = TaskStore::load(&paths.tasks_path)?;
    let git = Git::new(root);
    if !git.is_repo() {
        bail!("{} is not a git repository (run `planloop init`)", root.display());
    }

    let interrupt = InterruptFlag::new();
    install_ctrl_c(interrupt.clone())?;
    let runner = CommandSessionRunner::new(&config.session);
    let validator = CommandValidator::new(config.validate.command.clone());
    let replanner = ReplannerBackend::from_settings(&config.replanner);
    let ledger = CostLedger::new(&paths.cost_history_path);
    let journal = ProgressLog::new(&paths.progress_path);
    let collab = Collaborators {
        runner: &runner,
        validator: &validator,
        replanner: &replanner,
        vcs: &git,
        ledger: &ledger,
        journal: &journal,
        interrupt: &interrupt,
    };
    let options = RunOptions::from_config(&config, max_tasks);

    let outcome = run_loop(&paths, &mut store, &collab, &options, print_event)?;

    println!(
        "\n{} task(s) executed, {} re-planning cycle(s), cost ${:.2}",
        outcome.tasks_processed, outcome.replan_invocations, outcome.cost.total_usd
    );
    let code = match &outcome.stop {
        RunStop::Complete => {
            println!("all tasks completed");
            exit_codes::OK
        }
        RunStop::MaxTasksReached => {
            println!("stopped after --max-tasks; run again to continue");
            exit_codes::OK
        }
        RunStop::Halted { reason, failed } => {
            print!("{}", render_halt(&reason.to_string(), failed));
            exit_codes::HALTED
        }
        RunStop::Interrupted { task_id, restored } => {
            match task_id {
                Some(id) if *restored => {
                    println!("interrupted: task {id} returned to pending, working tree restored");
                }
                Some(id) => {
                    eprintln!(
                        "interrupted: task {id} returned to pending, but the working tree could not be restored"
                    );
                }
                None => println!("interrupted between tasks"),
            }
            exit_codes::INTERRUPTED
        }
    };
    Ok(code)
}

fn print_event(event: &LoopEvent<'_>) {
    match event {
        LoopEvent::Recovered { task_id } => {
            println!("recovered task {task_id} left in progress by an earlier run");
        }
        LoopEvent::TaskStarted { task } => println!("==> task {}: {}", task.id, task.description),
        LoopEvent::TaskFinished { task_id, outcome } => match outcome {
            GateOutcome::Completed { commit } => {
                println!("    task {task_id} completed ({})", commit.short());
            }
            GateOutcome::Failed { message, .. } => {
                let first = message.lines().next().unwrap_or_default();
                println!("    task {task_id} failed: {first}");
            }
        },
        LoopEvent::Replanned { cycle, summary } => println!(
            "re-planning cycle {cycle}: {} decision(s) applied, {} rejected",
            summary.applied(),
            summary.rejected.len()
        ),
    }
}
