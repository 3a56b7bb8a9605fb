//! Agent-side view of the notification channel.
//!
//! Notifications are hints. Before acting on one, an agent re-reads the task
//! and checks that it is still the one expected to act on it. A replayed or
//! outdated notification is then a no-op instead of a duplicate transition.

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::dispatch::{inbox_path, Notification};
use crate::error::StoreError;
use crate::state::responsible_role;
use crate::store::TaskStore;
use crate::task::{Role, Task, TaskId};

/// Outcome of re-checking a notification against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The task is still waiting on this role.
    Actionable(Task),
    /// Already handled by this inbox.
    Duplicate,
    /// The task moved on, or is no longer this role's to act on.
    Stale { reason: String },
}

pub struct Inbox {
    role: Role,
    path: PathBuf,
    offset: u64,
    /// `(task, status_since)` of every episode already handed out.
    handled: HashSet<(TaskId, u64)>,
    /// Read from the file but not yet re-checked against the store.
    pending: Vec<Notification>,
}

impl Inbox {
    /// Reads `<dir>/<role>.jsonl` from the beginning.
    pub fn new(dir: &Path, role: Role) -> Self {
        Inbox {
            role,
            path: inbox_path(dir, role),
            offset: 0,
            handled: HashSet::new(),
            pending: Vec::new(),
        }
    }

    /// Skip whatever is already in the file.
    pub fn from_end(dir: &Path, role: Role) -> Result<Self, StoreError> {
        let mut inbox = Self::new(dir, role);
        inbox.offset = match fs::metadata(&inbox.path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StoreError::io(&inbox.path, e)),
        };
        Ok(inbox)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// New complete lines since the last poll. A trailing partial line is
    /// left for the next call.
    pub fn poll(&mut self) -> Result<Vec<Notification>, StoreError> {
        let mut file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        let len = file
            .metadata()
            .map_err(|e| StoreError::io(&self.path, e))?
            .len();
        if len < self.offset {
            debug!(path = %self.path.display(), "Inbox truncated, starting over");
            self.offset = 0;
        }

        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(self.offset))
            .and_then(|_| file.read_to_end(&mut buf))
            .map_err(|e| StoreError::io(&self.path, e))?;
        let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        self.offset += end as u64 + 1;

        let mut out = Vec::new();
        for line in String::from_utf8_lossy(&buf[..end]).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Notification>(line) {
                Ok(n) => out.push(n),
                Err(e) => {
                    let path = self.path.display();
                    warn!(path = %path, error = %e, "Skipping malformed notification");
                }
            }
        }
        Ok(out)
    }

    /// Poll and re-check everything new, plus whatever an earlier call could
    /// not re-check. A notification whose re-check fails is kept for the
    /// next call instead of being dropped.
    pub fn drain<S>(&mut self, store: &S) -> Result<Vec<(Notification, Verdict)>, StoreError>
    where
        S: TaskStore + ?Sized,
    {
        let fresh = self.poll()?;
        let mut queue = std::mem::take(&mut self.pending);
        queue.extend(fresh);

        let mut out = Vec::new();
        for n in queue {
            match self.validate(store, &n) {
                Ok(verdict) => out.push((n, verdict)),
                Err(e) => {
                    warn!(task_id = %n.task_id, error = %e, "Could not re-check task, will retry");
                    self.pending.push(n);
                }
            }
        }
        Ok(out)
    }

    /// Notifications waiting for a successful re-check.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Re-check `notification` against the current store contents.
    ///
    /// A hint stays actionable for as long as the task sits in the status it
    /// announced with this role responsible. Edits that leave the status
    /// alone, such as notes or priority changes, do not make it stale. Each
    /// status episode is acted on at most once.
    pub fn validate<S>(
        &mut self,
        store: &S,
        notification: &Notification,
    ) -> Result<Verdict, StoreError>
    where
        S: TaskStore + ?Sized,
    {
        let snapshot = store.read()?;
        let Some(task) = snapshot.get(&notification.task_id) else {
            return Ok(Verdict::Stale {
                reason: "task no longer exists".into(),
            });
        };
        let moved_on = task.status != notification.new_status
            || task.version < notification.version
            || notification.version < task.status_since;
        if moved_on {
            return Ok(Verdict::Stale {
                reason: format!(
                    "task is now {} since version {} (notified {} at version {})",
                    task.status, task.status_since, notification.new_status, notification.version
                ),
            });
        }
        if responsible_role(task.status, task.assigned) != Some(self.role) {
            return Ok(Verdict::Stale {
                reason: format!("{} is not responsible for a {} task", self.role, task.status),
            });
        }

        if !self.handled.insert((task.id.clone(), task.status_since)) {
            return Ok(Verdict::Duplicate);
        }
        Ok(Verdict::Actionable(task.clone()))
    }
}
