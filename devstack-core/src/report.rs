//! Read-only renderings of the task store.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::store::Snapshot;
use crate::task::{Status, Task};

fn assigned(task: &Task) -> &'static str {
    task.assigned.map(|r| r.as_str()).unwrap_or("-")
}

/// Markdown status report: a count per status, then the tasks in each
/// non-empty status, then the backlog.
pub fn render_report(snapshot: &Snapshot, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Project Status Report - {}\n", now.format("%Y-%m-%d %H:%M"));

    out.push_str("## Summary\n\n| Status | Count |\n|--------|-------|\n");
    for status in Status::ALL {
        let _ = writeln!(out, "| {status} | {} |", snapshot.with_status(status).count());
    }
    out.push('\n');

    for status in Status::ALL {
        let tasks: Vec<&Task> = snapshot.with_status(status).collect();
        if tasks.is_empty() {
            continue;
        }
        let _ = writeln!(out, "## {status} ({})", tasks.len());
        for t in tasks {
            let _ = write!(
                out,
                "- **{}**: {} (Assigned: {}, Priority: {})",
                t.id,
                t.title,
                assigned(t),
                t.priority
            );
            if let Some(origin) = &t.origin {
                let _ = write!(out, " [remediates {origin}]");
            }
            out.push('\n');
        }
        out.push('\n');
    }

    if !snapshot.backlog.is_empty() {
        let _ = writeln!(out, "## Backlog ({})", snapshot.backlog.len());
        for item in &snapshot.backlog {
            let _ = writeln!(out, "- {item}");
        }
    }
    out
}

/// Fixed-width task table, optionally filtered by status.
pub fn render_table(snapshot: &Snapshot, status: Option<Status>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<8} {:<10} {:<10} {:<9} {:>4} TITLE",
        "ID", "STATUS", "ASSIGNED", "PRIORITY", "VER"
    );
    out.push_str(&"-".repeat(72));
    out.push('\n');
    for t in snapshot.tasks.iter().filter(|t| status.is_none_or(|s| t.status == s)) {
        let _ = writeln!(
            out,
            "{:<8} {:<10} {:<10} {:<9} {:>4} {}",
            t.id.as_str(),
            t.status.as_str(),
            assigned(t),
            t.priority.to_string(),
            t.version,
            t.title
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TransitionRequest;
    use crate::store::{MemoryTaskStore, Mutation, TaskStore};
    use crate::task::{NewTask, Role};

    fn snapshot() -> Snapshot {
        let store = MemoryTaskStore::new();
        let a = store.create(NewTask::new("Login page").assigned(Role::Dev1)).unwrap();
        store.create(NewTask::new("Signup page").assigned(Role::Dev2)).unwrap();
        let start = Mutation::Transition(TransitionRequest::new(Status::Wip, Role::Dev1));
        store.write(&a.id, &start, a.version).unwrap();
        let mut snap = store.read().unwrap();
        snap.backlog.push("Dark mode".into());
        snap
    }

    #[test]
    fn report_counts_every_status() {
        let report = render_report(&snapshot(), Utc::now());
        assert!(report.contains("| WIP | 1 |"));
        assert!(report.contains("| TODO | 1 |"));
        assert!(report.contains("| COMPLETED | 0 |"));
        let wip = "## WIP (1)\n- **T-001**: Login page (Assigned: Dev1, Priority: Medium)";
        assert!(report.contains(wip));
        assert!(!report.contains("## COMPLETED"));
        assert!(report.contains("## Backlog (1)\n- Dark mode"));
    }

    #[test]
    fn table_filters_by_status() {
        let snap = snapshot();
        let all = render_table(&snap, None);
        assert_eq!(all.lines().count(), 4);
        let todo = render_table(&snap, Some(Status::Todo));
        assert_eq!(todo.lines().count(), 3);
        assert!(todo.contains("Signup page"));
        assert!(!todo.contains("Login page"));
    }
}
