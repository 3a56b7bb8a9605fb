//! Core task types shared by every component of the pipeline.
//!
//! All objects are:
//! - Serializable via serde_json (the task file is human-inspectable)
//! - Versioned: every persisted mutation bumps `version`
//! - Identified by a `T-NNN` id that is never reused

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Stable task identifier, e.g. `T-010`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        TaskId(id.into())
    }

    /// Build the id for a sequence number (`7` → `T-007`).
    pub fn from_seq(seq: u64) -> Self {
        TaskId(format!("T-{seq:03}"))
    }

    /// Sequence number of a `T-NNN` id, if it has that shape.
    pub fn seq(&self) -> Option<u64> {
        self.0.strip_prefix("T-")?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

/// Accepts `t-7` as well as `T-007`.
impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty task id".into());
        }
        let upper = s.to_ascii_uppercase();
        Ok(match TaskId::new(upper.clone()).seq() {
            Some(seq) => TaskId::from_seq(seq),
            None => TaskId(upper),
        })
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Pipeline status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Todo,
    Wip,
    Testing,
    Review,
    Approved,
    Completed,
    Blocked,
    Rejected,
}

impl Status {
    /// Pipeline order, used for reports.
    pub const ALL: [Status; 8] = [
        Status::Completed,
        Status::Approved,
        Status::Review,
        Status::Testing,
        Status::Wip,
        Status::Todo,
        Status::Blocked,
        Status::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Todo => "TODO",
            Status::Wip => "WIP",
            Status::Testing => "TESTING",
            Status::Review => "REVIEW",
            Status::Approved => "APPROVED",
            Status::Completed => "COMPLETED",
            Status::Blocked => "BLOCKED",
            Status::Rejected => "REJECTED",
        }
    }

    /// COMPLETED and REJECTED end a task's run through the pipeline.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Rejected)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}

// ─── Roles ───────────────────────────────────────────────────────────────────

/// An agent role (or a non-agent actor) that can own or move a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Taskmaster,
    Dev1,
    Dev2,
    Testing,
    Review,
    DevOps,
    /// A human operator acting through the CLI.
    Human,
    /// The watcher itself, used for timeout escalation.
    Watcher,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::Taskmaster,
        Role::Dev1,
        Role::Dev2,
        Role::Testing,
        Role::Review,
        Role::DevOps,
        Role::Human,
        Role::Watcher,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Taskmaster => "Taskmaster",
            Role::Dev1 => "Dev1",
            Role::Dev2 => "Dev2",
            Role::Testing => "Testing",
            Role::Review => "Review",
            Role::DevOps => "DevOps",
            Role::Human => "Human",
            Role::Watcher => "Watcher",
        }
    }

    /// Roles backed by an agent runtime that can receive notifications.
    pub fn is_agent(self) -> bool {
        !matches!(self, Role::Human | Role::Watcher)
    }

    /// Roles allowed to reject, reopen and unblock tasks.
    pub fn is_supervisor(self) -> bool {
        matches!(self, Role::Taskmaster | Role::Human)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown role '{s}'"))
    }
}

// ─── Priority ────────────────────────────────────────────────────────────────

/// Advisory ordering; never consulted by the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Critical => "Critical",
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!("unknown priority '{s}'")),
        }
    }
}

// ─── Task ────────────────────────────────────────────────────────────────────

/// A unit of work carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub technical_notes: String,
    pub status: Status,
    /// Responsible agent role; `None` means unassigned.
    #[serde(default)]
    pub assigned: Option<Role>,
    #[serde(default)]
    pub priority: Priority,
    /// Tasks that must be COMPLETED before this one may leave TODO.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Incremented on every persisted mutation.
    pub version: u64,
    /// Version at which the task entered its current status. Notes and
    /// other edits bump `version` but leave this alone.
    #[serde(default)]
    pub status_since: u64,
    /// Status the task was in when it was blocked; cleared once it leaves
    /// BLOCKED. `Some(Approved)` marks an integration failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_from: Option<Status>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the task last entered WIP (timeout tracking).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files_changed: BTreeSet<String>,
    /// Blocked task this remediation task was created for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<TaskId>,
    /// `status_since` of the origin task when this remediation was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_episode: Option<u64>,
}

impl Task {
    /// Append a timestamped, attributed line to `technical_notes`.
    pub fn append_note(&mut self, actor: Role, note: &str, at: DateTime<Utc>) {
        if !self.technical_notes.is_empty() && !self.technical_notes.ends_with('\n') {
            self.technical_notes.push('\n');
        }
        self.technical_notes
            .push_str(&format!("[{} {actor}] {}", at.format("%Y-%m-%d %H:%M"), note.trim()));
    }
}

/// Fields supplied by whoever creates a task. The store assigns id,
/// status, version and timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub technical_notes: String,
    #[serde(default)]
    pub assigned: Option<Role>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub files_changed: BTreeSet<String>,
    #[serde(default)]
    pub origin: Option<TaskId>,
    #[serde(default)]
    pub origin_episode: Option<u64>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        NewTask {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn assigned(mut self, role: Role) -> Self {
        self.assigned = Some(role);
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn technical_notes(mut self, notes: impl Into<String>) -> Self {
        self.technical_notes = notes.into();
        self
    }
}
