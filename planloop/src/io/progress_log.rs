//! Human-readable progress journal in `.planloop/progress.md`.
//!
//! One markdown section per task event. The most recent entries are handed
//! to the next session as context.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

const HEADER: &str = "# Progress\n";
const SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEvent {
    Started,
    Completed,
    Failed,
    Replanned,
    Interrupted,
}

impl JournalEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalEvent::Started => "started",
            JournalEvent::Completed => "completed",
            JournalEvent::Failed => "failed",
            JournalEvent::Replanned => "replanned",
            JournalEvent::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JournalEntry<'a> {
    pub task_id: &'a str,
    pub description: &'a str,
    pub event: JournalEvent,
    pub session_id: Option<&'a str>,
    pub details: &'a str,
}

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &JournalEntry<'_>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut section = String::new();
        if !self.path.exists() {
            section.push_str(HEADER);
        }
        section.push_str(SEPARATOR);
        section.push_str(&format!(
            "## [{}] Task {}: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            entry.task_id,
            entry.description
        ));
        section.push_str(&format!("**event**: {}\n", entry.event.as_str()));
        if let Some(session_id) = entry.session_id {
            section.push_str(&format!("**session**: {session_id}\n"));
        }
        let details = entry.details.trim().replace(SEPARATOR, "\n- - -\n");
        if !details.is_empty() {
            section.push('\n');
            section.push_str(&details);
            section.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(section.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }

    /// The last `count` entries, oldest first, or `None` if there are none.
    pub fn recent(&self, count: usize) -> Result<Option<String>> {
        if count == 0 || !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let entries: Vec<&str> = contents
            .split(SEPARATOR)
            .skip(1)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }
        let start = entries.len().saturating_sub(count);
        Ok(Some(entries[start..].join("\n\n")))
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry<'a>(task_id: &'a str, event: JournalEvent, details: &'a str) -> JournalEntry<'a> {
        JournalEntry {
            task_id,
            description: "demo",
            event,
            session_id: Some("s-1"),
            details,
        }
    }

    #[test]
    fn recent_returns_last_entries_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ProgressLog::new(temp.path().join("progress.md"));
        log.append(&entry("1", JournalEvent::Completed, "built lexer"))
            .expect("append");
        log.append(&entry("2", JournalEvent::Failed, "validation failed: 2 tests"))
            .expect("append");
        log.append(&entry("3", JournalEvent::Started, "")).expect("append");

        let recent = log.recent(2).expect("recent").expect("entries");
        assert!(!recent.contains("built lexer"));
        let failed_at = recent.find("Task 2").expect("task 2");
        let started_at = recent.find("Task 3").expect("task 3");
        assert!(failed_at < started_at);
        assert!(recent.contains("**event**: failed"));

        let contents = fs::read_to_string(log.path()).expect("read");
        assert!(contents.starts_with(HEADER));
    }

    #[test]
    fn empty_or_missing_log_has_no_recent_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ProgressLog::new(temp.path().join("progress.md"));
        assert_eq!(log.recent(3).expect("recent"), None);
        log.clear().expect("clear missing");
    }
}
