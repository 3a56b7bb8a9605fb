//! Turns change events into notifications for the responsible agent.
//!
//! Delivery is at-least-once and best effort. There is no acknowledgement
//! path back into the task store: a notification only tells an agent to
//! re-read the task. If a runtime cannot be reached the event is dropped and
//! the watcher derives it again on its next cycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::state::responsible_role;
use crate::task::{Role, Status, TaskId};

// ─── Events ──────────────────────────────────────────────────────────────────

/// The watcher's inferred diff of one task between two polling cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub task_id: TaskId,
    pub title: String,
    /// Task version the event was derived from.
    pub version: u64,
    /// `None` for a task seen for the first time.
    pub previous_status: Option<Status>,
    pub previous_assigned: Option<Role>,
    pub new_status: Status,
    pub new_assigned: Option<Role>,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn status_changed(&self) -> bool {
        self.previous_status != Some(self.new_status)
    }

    /// Who should hear about this change, if anyone.
    pub fn recipient(&self) -> Option<Role> {
        let next = responsible_role(self.new_status, self.new_assigned);
        if !self.status_changed() {
            let before = self
                .previous_status
                .and_then(|s| responsible_role(s, self.previous_assigned));
            if before == next {
                return None;
            }
        }
        next
    }
}

/// Payload delivered to an agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub task_id: TaskId,
    pub title: String,
    pub new_status: Status,
    pub assigned: Option<Role>,
    pub version: u64,
}

impl Notification {
    pub fn from_event(event: &ChangeEvent) -> Self {
        Notification {
            task_id: event.task_id.clone(),
            title: event.title.clone(),
            new_status: event.new_status,
            assigned: event.new_assigned,
            version: event.version,
        }
    }

    /// One-line human-readable form.
    pub fn message(&self) -> String {
        let assigned = self.assigned.map(|r| r.as_str()).unwrap_or("unassigned");
        format!(
            "TASK UPDATE: {} - {} (Status: {}, Assigned: {assigned})",
            self.task_id, self.title, self.new_status
        )
    }
}

// ─── Notifiers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("{role} runtime unreachable: {reason}")]
    Unreachable { role: Role, reason: String },
    #[error("no runtime configured for {0}")]
    NoRuntime(Role),
}

/// Out-of-band channel to an agent runtime.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, role: Role, notification: &Notification) -> Result<(), DispatchError>;
}

/// Path of a role's inbox file under `dir`.
pub fn inbox_path(dir: &Path, role: Role) -> PathBuf {
    dir.join(format!("{}.jsonl", role.as_str().to_lowercase()))
}

/// Appends one JSON line per notification to `<dir>/<role>.jsonl`.
pub struct FileNotifier {
    dir: PathBuf,
}

impl FileNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileNotifier { dir: dir.into() }
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    async fn notify(&self, role: Role, notification: &Notification) -> Result<(), DispatchError> {
        let unreachable = |reason: String| DispatchError::Unreachable { role, reason };
        let mut line = serde_json::to_string(notification).map_err(|e| unreachable(e.to_string()))?;
        line.push('\n');

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| unreachable(format!("{}: {e}", self.dir.display())))?;
        let path = inbox_path(&self.dir, role);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| unreachable(format!("{}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| unreachable(format!("{}: {e}", path.display())))?;
        file.flush().await.map_err(|e| unreachable(e.to_string()))?;
        Ok(())
    }
}

/// Runs a command against the agent's runtime, e.g. `docker exec`.
///
/// Arguments are templates. Recognised placeholders: `{runtime}`, `{role}`,
/// `{task_id}`, `{status}`, `{assigned}`, `{message}` and `{json}`.
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
    runtimes: BTreeMap<Role, String>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        runtimes: BTreeMap<Role, String>,
        timeout: Duration,
    ) -> Self {
        CommandNotifier {
            program: program.into(),
            args,
            runtimes,
            timeout,
        }
    }

    /// Writes the JSON line into `/tmp/agent_notifications` inside a
    /// container named after the runtime.
    pub fn docker(runtimes: BTreeMap<Role, String>) -> Self {
        let args = [
            "exec",
            "{runtime}",
            "sh",
            "-c",
            "printf '%s\\n' \"$1\" >> /tmp/agent_notifications",
            "notify",
            "{json}",
        ];
        Self::new(
            "docker",
            args.iter().map(|s| s.to_string()).collect(),
            runtimes,
            Duration::from_secs(10),
        )
    }

    fn render_args(
        &self,
        runtime: &str,
        role: Role,
        n: &Notification,
    ) -> Result<Vec<String>, DispatchError> {
        let json = serde_json::to_string(n).map_err(|e| DispatchError::Unreachable {
            role,
            reason: e.to_string(),
        })?;
        let message = n.message();
        let values = [
            ("runtime", runtime),
            ("role", role.as_str()),
            ("task_id", n.task_id.as_str()),
            ("status", n.new_status.as_str()),
            ("assigned", n.assigned.map(|r| r.as_str()).unwrap_or("")),
            ("message", message.as_str()),
            ("json", json.as_str()),
        ];
        Ok(self.args.iter().map(|arg| render_template(arg, &values)).collect())
    }
}

/// Expand `{key}` placeholders in one pass. Substituted text is never
/// scanned again, and unknown placeholders are kept as written.
fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, close))
        });
        match value {
            Some((v, close)) => {
                out.push_str(v);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, role: Role, notification: &Notification) -> Result<(), DispatchError> {
        let runtime = self
            .runtimes
            .get(&role)
            .ok_or(DispatchError::NoRuntime(role))?;
        let args = self.render_args(runtime, role, notification)?;
        let unreachable = |reason: String| DispatchError::Unreachable { role, reason };

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program).args(&args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| unreachable(format!("timed out after {:?}", self.timeout)))?
        .map_err(|e| unreachable(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unreachable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Keeps every delivered notification in memory. Roles can be marked
/// unreachable to exercise the drop path.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Role, Notification)>>,
    unreachable: Mutex<HashSet<Role>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, role: Role, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(role);
        } else {
            set.remove(&role);
        }
    }

    pub fn sent(&self) -> Vec<(Role, Notification)> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<(Role, Notification)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, role: Role, notification: &Notification) -> Result<(), DispatchError> {
        if self.unreachable.lock().contains(&role) {
            return Err(DispatchError::Unreachable {
                role,
                reason: "marked unreachable".into(),
            });
        }
        self.sent.lock().push((role, notification.clone()));
        Ok(())
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

/// What happened to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Delivered(Role),
    /// Already delivered within the dedupe window.
    Duplicate(Role),
    /// Nobody acts on the task in its new state.
    NoRecipient,
    Dropped { role: Role, error: DispatchError },
}

impl Delivery {
    /// Whether the event needs no further delivery attempts.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Delivery::Dropped { .. })
    }
}

type DedupeKey = (TaskId, u64, Role);

pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    dedupe_window: Duration,
    recent: Mutex<HashMap<DedupeKey, Instant>>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, dedupe_window: Duration) -> Self {
        Dispatcher {
            notifier,
            dedupe_window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver one event to its recipient.
    pub async fn dispatch(&self, event: &ChangeEvent) -> Delivery {
        let Some(role) = event.recipient() else {
            debug!(task_id = %event.task_id, status = %event.new_status, "No recipient for change");
            return Delivery::NoRecipient;
        };

        let key = (event.task_id.clone(), event.version, role);
        {
            let now = Instant::now();
            let mut recent = self.recent.lock();
            recent.retain(|_, at| now.duration_since(*at) < self.dedupe_window);
            if recent.contains_key(&key) {
                debug!(
                    task_id = %event.task_id,
                    version = event.version,
                    %role,
                    "Duplicate notification suppressed"
                );
                return Delivery::Duplicate(role);
            }
        }

        let notification = Notification::from_event(event);
        match self.notifier.notify(role, &notification).await {
            Ok(()) => {
                self.recent.lock().insert(key, Instant::now());
                info!(
                    task_id = %event.task_id,
                    %role,
                    status = %event.new_status,
                    version = event.version,
                    "Notified agent"
                );
                Delivery::Delivered(role)
            }
            Err(error) => {
                warn!(
                    task_id = %event.task_id,
                    %role,
                    %error,
                    "Dispatch dropped; will retry next cycle"
                );
                Delivery::Dropped { role, error }
            }
        }
    }

    /// Deliver a cycle's batch. Events for different agents carry no
    /// ordering guarantee relative to each other.
    pub async fn dispatch_batch(&self, events: &[ChangeEvent]) -> Vec<Delivery> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            out.push(self.dispatch(event).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(
        status: Status,
        prev: Option<Status>,
        assigned: Option<Role>,
        version: u64,
    ) -> ChangeEvent {
        ChangeEvent {
            task_id: TaskId::from("T-010"),
            title: "Login page".into(),
            version,
            previous_status: prev,
            previous_assigned: assigned,
            new_status: status,
            new_assigned: assigned,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn recipients_follow_the_pipeline() {
        let dev = Some(Role::Dev1);
        assert_eq!(event(Status::Todo, None, dev, 1).recipient(), Some(Role::Dev1));
        let to_testing = event(Status::Testing, Some(Status::Wip), dev, 3);
        assert_eq!(to_testing.recipient(), Some(Role::Testing));
        let to_devops = event(Status::Approved, Some(Status::Review), dev, 5);
        assert_eq!(to_devops.recipient(), Some(Role::DevOps));
        assert_eq!(event(Status::Completed, Some(Status::Approved), dev, 6).recipient(), None);
        assert_eq!(event(Status::Todo, None, None, 1).recipient(), None);
    }

    #[test]
    fn reassignment_notifies_only_when_recipient_changes() {
        let mut e = event(Status::Todo, Some(Status::Todo), Some(Role::Dev2), 2);
        e.previous_assigned = Some(Role::Dev1);
        assert_eq!(e.recipient(), Some(Role::Dev2));

        let mut e = event(Status::Review, Some(Status::Review), Some(Role::Dev2), 7);
        e.previous_assigned = Some(Role::Dev1);
        assert_eq!(e.recipient(), None);
    }

    #[test]
    fn message_is_one_line() {
        let e = event(Status::Wip, Some(Status::Todo), Some(Role::Dev1), 2);
        let n = Notification::from_event(&e);
        assert_eq!(n.message(), "TASK UPDATE: T-010 - Login page (Status: WIP, Assigned: Dev1)");
    }

    #[tokio::test]
    async fn replayed_event_is_suppressed() {
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = Dispatcher::new(notifier.clone(), Duration::from_secs(30));
        let e = event(Status::Testing, Some(Status::Wip), Some(Role::Dev1), 3);

        assert_eq!(dispatcher.dispatch(&e).await, Delivery::Delivered(Role::Testing));
        assert_eq!(dispatcher.dispatch(&e).await, Delivery::Duplicate(Role::Testing));
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_runtime_drops_without_recording() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.set_unreachable(Role::Testing, true);
        let dispatcher = Dispatcher::new(notifier.clone(), Duration::from_secs(30));
        let e = event(Status::Testing, Some(Status::Wip), Some(Role::Dev1), 3);

        let first = dispatcher.dispatch(&e).await;
        assert!(!first.is_settled());

        notifier.set_unreachable(Role::Testing, false);
        assert_eq!(dispatcher.dispatch(&e).await, Delivery::Delivered(Role::Testing));
    }

    #[tokio::test]
    async fn file_notifier_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = FileNotifier::new(dir.path());
        let n1 = Notification::from_event(&event(Status::Todo, None, Some(Role::Dev1), 1));
        let e2 = event(Status::Wip, Some(Status::Todo), Some(Role::Dev1), 2);
        let n2 = Notification::from_event(&e2);
        notifier.notify(Role::Dev1, &n1).await.unwrap();
        notifier.notify(Role::Dev1, &n2).await.unwrap();

        let raw = std::fs::read_to_string(inbox_path(dir.path(), Role::Dev1)).unwrap();
        let parsed: Vec<Notification> =
            raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(parsed, vec![n1, n2]);
    }

    #[tokio::test]
    async fn command_notifier_requires_a_runtime() {
        let notifier = CommandNotifier::docker(BTreeMap::new());
        let n = Notification::from_event(&event(Status::Todo, None, Some(Role::Dev1), 1));
        assert_eq!(
            notifier.notify(Role::Dev1, &n).await.unwrap_err(),
            DispatchError::NoRuntime(Role::Dev1)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_notifier_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut runtimes = BTreeMap::new();
        runtimes.insert(Role::Review, "agent_review".to_string());
        let notifier = CommandNotifier::new(
            "sh",
            vec![
                "-c".into(),
                format!("printf '%s %s %s' \"$1\" \"$2\" \"$3\" > {}", out.display()),
                "sh".into(),
                "{runtime}".into(),
                "{task_id}".into(),
                "{status}".into(),
            ],
            runtimes,
            Duration::from_secs(5),
        );
        let e = event(Status::Review, Some(Status::Testing), Some(Role::Dev1), 4);
        let n = Notification::from_event(&e);
        notifier.notify(Role::Review, &n).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "agent_review T-010 REVIEW");
    }

    #[test]
    fn placeholders_in_the_title_are_not_expanded() {
        let mut runtimes = BTreeMap::new();
        runtimes.insert(Role::Dev1, "agent_dev1".to_string());
        let notifier = CommandNotifier::new(
            "notify",
            vec!["{message}".into(), "{task_id}:{json}".into(), "{unknown} {".into()],
            runtimes,
            Duration::from_secs(5),
        );
        let mut e = event(Status::Todo, None, Some(Role::Dev1), 1);
        e.title = "Escape {json} and {task_id}".into();
        let n = Notification::from_event(&e);

        let args = notifier.render_args("agent_dev1", Role::Dev1, &n).unwrap();
        assert_eq!(
            args[0],
            "TASK UPDATE: T-010 - Escape {json} and {task_id} (Status: TODO, Assigned: Dev1)"
        );
        let json = args[1].strip_prefix("T-010:").unwrap();
        let parsed: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.title, "Escape {json} and {task_id}");
        assert_eq!(args[2], "{unknown} {");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_unreachable() {
        let mut runtimes = BTreeMap::new();
        runtimes.insert(Role::Dev1, "agent_dev1".to_string());
        let notifier = CommandNotifier::new("false", vec![], runtimes, Duration::from_secs(5));
        let n = Notification::from_event(&event(Status::Todo, None, Some(Role::Dev1), 1));
        assert!(matches!(
            notifier.notify(Role::Dev1, &n).await,
            Err(DispatchError::Unreachable { role: Role::Dev1, .. })
        ));
    }
}
