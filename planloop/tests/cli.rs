//! CLI tests: spawn the `planloop` binary and check exit codes and output.

use std::process::{Command, Output};

use planloop::exit_codes;
use planloop::io::config::{PlanConfig, write_config};
use planloop::io::init::PlanPaths;
use planloop::task::TaskStatus;
use planloop::test_support::{TestRepo, failed_task, task};

fn planloop(root: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_planloop"))
        .arg("-C")
        .arg(root)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("spawn planloop")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn configure(repo: &TestRepo, edit: impl FnOnce(&mut PlanConfig)) {
    let mut config = PlanConfig::default();
    config.session.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "cat > /dev/null; echo step >> work.log".to_string(),
    ];
    config.validate.command = vec!["true".to_string()];
    edit(&mut config);
    write_config(&PlanPaths::new(repo.path()).config_path, &config).expect("write config");
}

#[test]
fn init_creates_state_and_prints_format_hint() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = planloop(temp.path(), &["init"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(stdout(&output).contains("add tasks to .planloop/tasks.json"));
    let paths = PlanPaths::new(temp.path());
    assert!(paths.config_path.exists());
    assert!(paths.tasks_path.exists());
    assert!(temp.path().join(".git").exists());
}

#[test]
fn run_without_init_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = planloop(temp.path(), &["run"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("planloop init"));
}

#[test]
fn status_shows_counts_and_next_task() {
    let repo = TestRepo::new().expect("repo");
    repo.with_tasks(vec![task("1"), task("2")]).expect("tasks");

    let output = planloop(repo.path(), &["status"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let text = stdout(&output);
    assert!(text.contains("tasks: 2 total, 0 completed, 2 pending"), "{text}");
    assert!(text.contains("next: 1"), "{text}");
}

#[test]
fn reset_unknown_task_is_invalid() {
    let repo = TestRepo::new().expect("repo");
    repo.with_tasks(vec![failed_task("1", "boom", 1)])
        .expect("tasks");

    let output = planloop(repo.path(), &["reset", "9"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains('9'));
}

#[test]
fn reset_returns_failed_task_to_pending() {
    let repo = TestRepo::new().expect("repo");
    repo.with_tasks(vec![failed_task("1", "boom", 1)])
        .expect("tasks");

    let output = planloop(repo.path(), &["reset", "1"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let task = repo.load_tasks().expect("load").tasks()[0].clone();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retries, 1);
}

#[cfg(unix)]
#[test]
fn run_completes_every_task() {
    let repo = TestRepo::new().expect("repo");
    repo.with_tasks(vec![task("1"), task("1.1"), task("2")])
        .expect("tasks");
    configure(&repo, |_| {});
    let base = repo.git().head().expect("head");

    let output = planloop(repo.path(), &["run"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stdout(&output));
    assert!(stdout(&output).contains("all tasks completed"));
    let saved = repo.load_tasks().expect("load");
    assert!(
        saved
            .tasks()
            .iter()
            .all(|t| t.status == TaskStatus::Completed)
    );
    assert_eq!(repo.git().commits_since(&base).expect("count"), 3);
    assert!(PlanPaths::new(repo.path()).task_dir("1.1").join("session.log").exists());
}

#[cfg(unix)]
#[test]
fn run_with_max_tasks_stops_early() {
    let repo = TestRepo::new().expect("repo");
    repo.with_tasks(vec![task("1"), task("2")]).expect("tasks");
    configure(&repo, |_| {});

    let output = planloop(repo.path(), &["run", "--max-tasks", "1"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let saved = repo.load_tasks().expect("load");
    assert_eq!(saved.get("2").expect("task 2").status, TaskStatus::Pending);
}

#[cfg(unix)]
#[test]
fn failing_validation_halts_with_report() {
    let repo = TestRepo::new().expect("repo");
    repo.with_tasks(vec![task("1")]).expect("tasks");
    configure(&repo, |config| {
        config.validate.command = vec!["false".to_string()];
        config.max_task_retries = 0;
    });

    let output = planloop(repo.path(), &["run"]);

    assert_eq!(output.status.code(), Some(exit_codes::HALTED));
    let text = stdout(&output);
    assert!(text.contains("run halted"), "{text}");
    assert!(text.contains("[!] 1: task 1 (retries: 0)"), "{text}");
    assert!(text.contains("validation failed: exit code 1"), "{text}");
}

#[cfg(unix)]
#[test]
fn log_tails_task_logs_after_a_run() {
    let repo = TestRepo::new().expect("repo");
    repo.with_tasks(vec![task("1")]).expect("tasks");
    configure(&repo, |config| {
        config.session.command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; echo first; echo second; echo TASK_COMPLETED".to_string(),
        ];
    });
    assert_eq!(planloop(repo.path(), &["run"]).status.code(), Some(exit_codes::OK));

    let output = planloop(repo.path(), &["log", "1", "-n", "1"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let text = stdout(&output);
    assert!(text.contains("stream.jsonl (last 1 of 3 lines)"), "{text}");
    assert!(text.contains("TASK_COMPLETED"), "{text}");
    assert!(!text.contains("first"), "{text}");

    let missing = planloop(repo.path(), &["log", "9"]);
    assert_eq!(missing.status.code(), Some(exit_codes::INVALID));
}
