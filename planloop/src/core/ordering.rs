//! Task id schemes and the total execution order derived from them.
//!
//! Two schemes exist:
//! - **Hierarchical**: dotted numeric ids (`"2.1.3"`), ordered segment by
//!   segment as integers. A prefix sorts before its extensions, so a parent
//!   precedes its children (pre-order).
//! - **Priority**: every task carries an integer `priority`; lower runs first,
//!   ties broken by id.

use std::cmp::Ordering;
use std::fmt;

use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdScheme {
    Hierarchical,
    Priority,
}

impl fmt::Display for IdScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdScheme::Hierarchical => f.write_str("hierarchical"),
            IdScheme::Priority => f.write_str("priority"),
        }
    }
}

/// Parsed dotted numeric id. The derived `Ord` compares segments
/// lexicographically, which puts `[2]` before `[2, 1]` before `[10]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdPath(Vec<u64>);

impl IdPath {
    /// Parse `"2.1.3"`; returns `None` for anything that is not dot-separated digits.
    pub fn parse(id: &str) -> Option<Self> {
        let mut segments = Vec::new();
        for part in id.split('.') {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            segments.push(part.parse().ok()?);
        }
        Some(Self(segments))
    }

    pub fn segments(&self) -> &[u64] {
        &self.0
    }
}

impl fmt::Display for IdPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Determine which id scheme a task list uses.
///
/// An empty list is treated as hierarchical. Mixed lists are rejected.
pub fn detect_scheme(tasks: &[Task]) -> Result<IdScheme, String> {
    if tasks.is_empty() {
        return Ok(IdScheme::Hierarchical);
    }
    let with_priority = tasks.iter().filter(|t| t.priority.is_some()).count();
    if with_priority == tasks.len() {
        return Ok(IdScheme::Priority);
    }
    if with_priority > 0 {
        return Err(format!(
            "mixed id schemes: {with_priority} of {} tasks carry a priority",
            tasks.len()
        ));
    }
    let bad: Vec<&str> = tasks
        .iter()
        .filter(|t| IdPath::parse(&t.id).is_none())
        .map(|t| t.id.as_str())
        .collect();
    if bad.is_empty() {
        Ok(IdScheme::Hierarchical)
    } else {
        Err(format!(
            "ids must be dotted numbers when no priority is given: {}",
            bad.join(", ")
        ))
    }
}

/// Compare two ids numerically by segment when both parse, else as strings.
///
/// Equal numeric paths with different spellings (`"01"` vs `"1"`) fall back to
/// string order so the result stays a total order.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (IdPath::parse(a), IdPath::parse(b)) {
        (Some(left), Some(right)) => left.cmp(&right).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

pub fn compare_tasks(scheme: IdScheme, a: &Task, b: &Task) -> Ordering {
    match scheme {
        IdScheme::Hierarchical => compare_ids(&a.id, &b.id),
        IdScheme::Priority => a
            .priority
            .cmp(&b.priority)
            .then_with(|| compare_ids(&a.id, &b.id)),
    }
}

pub fn sort_tasks(scheme: IdScheme, tasks: &mut [Task]) {
    tasks.sort_by(|a, b| compare_tasks(scheme, a, b));
}

/// Allocate `count` fresh child ids under `parent_id`.
///
/// Numbering continues after the highest existing direct child so new
/// children sort after the ones already present.
pub fn allocate_child_ids(parent_id: &str, tasks: &[Task], count: usize) -> Vec<String> {
    let prefix = format!("{parent_id}.");
    let highest = tasks
        .iter()
        .filter_map(|t| t.id.strip_prefix(&prefix))
        .filter_map(|rest| rest.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    let mut ids = Vec::with_capacity(count);
    let mut next = highest + 1;
    while ids.len() < count {
        let candidate = format!("{parent_id}.{next}");
        if !tasks.iter().any(|t| t.id == candidate) {
            ids.push(candidate);
        }
        next += 1;
    }
    ids
}

/// Suggest the next free id at the top level (`parent_id = None`) or under a parent.
pub fn suggest_next_id(tasks: &[Task], parent_id: Option<&str>) -> String {
    match parent_id {
        Some(parent) => allocate_child_ids(parent, tasks, 1)
            .pop()
            .unwrap_or_else(|| format!("{parent}.1")),
        None => {
            let highest = tasks
                .iter()
                .filter_map(|t| IdPath::parse(&t.id))
                .filter_map(|path| path.segments().first().copied())
                .max()
                .unwrap_or(0);
            (highest + 1).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{prioritized, task};

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn hierarchical_order_is_preorder_with_numeric_segments() {
        let mut tasks = vec![
            task("10"),
            task("2.1"),
            task("1"),
            task("2"),
            task("2.10"),
            task("2.2"),
            task("1.1"),
        ];
        sort_tasks(IdScheme::Hierarchical, &mut tasks);
        assert_eq!(ids(&tasks), vec!["1", "1.1", "2", "2.1", "2.2", "2.10", "10"]);
    }

    #[test]
    fn priority_order_breaks_ties_by_id() {
        let mut tasks = vec![
            prioritized("setup", 2),
            prioritized("b", 1),
            prioritized("a", 1),
        ];
        sort_tasks(IdScheme::Priority, &mut tasks);
        assert_eq!(ids(&tasks), vec!["a", "b", "setup"]);
    }

    #[test]
    fn detects_schemes_and_rejects_mixtures() {
        assert_eq!(
            detect_scheme(&[task("1"), task("1.1")]),
            Ok(IdScheme::Hierarchical)
        );
        assert_eq!(
            detect_scheme(&[prioritized("x", 1), prioritized("y", 0)]),
            Ok(IdScheme::Priority)
        );
        assert!(detect_scheme(&[task("1"), prioritized("2", 1)]).is_err());
        let err = detect_scheme(&[task("1"), task("setup")]).unwrap_err();
        assert!(err.contains("setup"));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(IdPath::parse("1..2"), None);
        assert_eq!(IdPath::parse("1.a"), None);
        assert_eq!(IdPath::parse(""), None);
        assert_eq!(IdPath::parse("3.04").map(|p| p.to_string()), Some("3.4".to_string()));
    }

    #[test]
    fn child_ids_continue_after_highest_existing_child() {
        let tasks = vec![task("2"), task("2.1"), task("2.3"), task("3")];
        assert_eq!(allocate_child_ids("2", &tasks, 2), vec!["2.4", "2.5"]);
        assert_eq!(allocate_child_ids("3", &tasks, 1), vec!["3.1"]);
    }

    #[test]
    fn suggests_next_top_level_and_child_ids() {
        let tasks = vec![task("1"), task("2"), task("2.1")];
        assert_eq!(suggest_next_id(&tasks, None), "3");
        assert_eq!(suggest_next_id(&tasks, Some("2")), "2.2");
        assert_eq!(suggest_next_id(&[], None), "1");
    }
}
