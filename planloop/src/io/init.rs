//! Workspace layout and `.planloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, warn};

use crate::io::config::{PlanConfig, write_config};
use crate::io::git::Git;
use crate::io::task_store::TaskStore;

/// Directories a run must never be pointed at (or directly beneath).
const FORBIDDEN_ROOTS: &[&str] = &[
    "/", "/etc", "/usr", "/bin", "/sbin", "/var", "/System", "/Library",
];

const STATE_GITIGNORE: &str = "*\n";

/// All canonical paths within `.planloop/` for a workspace root.
#[derive(Debug, Clone)]
pub struct PlanPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub tasks_path: PathBuf,
    pub config_path: PathBuf,
    pub progress_path: PathBuf,
    pub cost_history_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub replan_dir: PathBuf,
}

impl PlanPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".planloop");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: state_dir.join(".gitignore"),
            tasks_path: state_dir.join("tasks.json"),
            config_path: state_dir.join("config.toml"),
            progress_path: state_dir.join("progress.md"),
            cost_history_path: state_dir.join("cost_history.jsonl"),
            sessions_dir: state_dir.join("sessions"),
            replan_dir: state_dir.join("replan"),
        }
    }

    /// Per-task artifact directory (stream log, validation log).
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        let safe: String = task_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.sessions_dir.join(safe)
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// If true, rewrite `config.toml` with defaults.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub paths: PlanPaths,
    pub created_repo: bool,
    pub created_tasks: bool,
}

/// Create `.planloop/` scaffolding in `root` and make sure it is a git repo
/// with at least one commit.
///
/// Existing task lists are never overwritten.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<InitOutcome> {
    ensure_safe_workspace(root)?;
    let paths = PlanPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        bail!("{} exists but is not a directory", paths.state_dir.display());
    }

    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    fs::write(&paths.gitignore_path, STATE_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;

    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &PlanConfig::default())?;
    }

    let created_tasks = !paths.tasks_path.exists();
    if created_tasks {
        TaskStore::empty(&paths.tasks_path).save()?;
    }

    let git = Git::new(root);
    let created_repo = !git.is_repo();
    if created_repo {
        git.init()?;
        info!(root = %root.display(), "initialized git repository");
    } else if !git.status_porcelain()?.is_empty() {
        warn!("workspace has uncommitted changes; rolling back an interrupted task discards them");
    }
    git.ensure_identity()?;
    if created_repo || !git.has_commits() {
        git.commit_all("chore(planloop): initial snapshot")
            .context("create initial commit")?;
    }

    Ok(InitOutcome {
        paths,
        created_repo,
        created_tasks,
    })
}

/// Refuse system directories and their immediate children.
pub fn ensure_safe_workspace(root: &Path) -> Result<()> {
    let absolute = std::path::absolute(root)
        .with_context(|| format!("resolve workspace {}", root.display()))?;
    let text = absolute.to_string_lossy();
    let text = if text.len() > 1 {
        text.trim_end_matches('/')
    } else {
        &text
    };
    let depth = text.matches('/').count();
    for forbidden in FORBIDDEN_ROOTS {
        let inside = *forbidden != "/"
            && text
                .strip_prefix(forbidden)
                .is_some_and(|rest| rest.starts_with('/'));
        if text == *forbidden || (inside && depth <= 2) {
            return Err(anyhow!(
                "refusing to use {} as a workspace (system directory)",
                absolute.display()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::test_support::TestRepo;

    #[test]
    fn unsafe_workspaces_are_rejected() {
        for path in ["/", "/usr", "/usr/local", "/var/lib", "/etc"] {
            assert!(
                ensure_safe_workspace(Path::new(path)).is_err(),
                "{path} should be rejected"
            );
        }
        for path in ["/home/alice/project", "/usr/local/src/app", "/work/app", "/tmp"] {
            assert!(
                ensure_safe_workspace(Path::new(path)).is_ok(),
                "{path} should be accepted"
            );
        }
    }

    #[test]
    fn task_dir_sanitizes_ids() {
        let paths = PlanPaths::new("/work/app");
        assert!(paths.task_dir("2.1").ends_with(".planloop/sessions/2.1"));
        assert!(paths.task_dir("a/b").ends_with(".planloop/sessions/a_b"));
    }

    /// Verifies init on an existing repository creates the layout without
    /// touching an existing task list.
    #[test]
    fn init_creates_layout_and_keeps_tasks() {
        let repo = TestRepo::new().expect("repo");
        let paths = PlanPaths::new(repo.path());
        fs::create_dir_all(&paths.state_dir).expect("mkdir");
        fs::write(&paths.tasks_path, r#"[{"id":"1","description":"keep me"}]"#)
            .expect("write tasks");

        let outcome = init_workspace(repo.path(), &InitOptions::default()).expect("init");

        assert!(!outcome.created_repo);
        assert!(!outcome.created_tasks);
        assert!(paths.config_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            STATE_GITIGNORE
        );
        let store = TaskStore::load(&paths.tasks_path).expect("load");
        assert_eq!(store.tasks()[0].description, "keep me");
        assert_eq!(load_config(&paths.config_path).expect("config"), PlanConfig::default());
    }

    #[test]
    fn init_creates_repository_with_initial_commit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("mkdir");
        let outcome = init_workspace(&root, &InitOptions::default()).expect("init");

        assert!(outcome.created_repo);
        assert!(outcome.created_tasks);
        let git = Git::new(&root);
        assert!(git.has_commits());
        assert!(git.status_porcelain().expect("status").is_empty());
    }
}
