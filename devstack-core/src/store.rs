//! Task store: the single source of truth for task state.
//!
//! Two backends share one contract: [`JsonTaskStore`] keeps the whole store
//! in a human-readable JSON file that is only ever replaced atomically
//! (write a side file, then rename over the original), and
//! [`MemoryTaskStore`] keeps it in process for tests and embedding.
//!
//! Concurrency control is optimistic: every write names the version it was
//! computed from and is refused with [`StoreError::VersionConflict`] if the
//! stored task has moved on. No lock is held between a read and a write.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::state::{self, DependencyView, TransitionRequest};
use crate::task::{NewTask, Priority, Role, Status, Task, TaskId};

/// How many times a file write is recomputed when another process replaced
/// the file between our read and our rename.
const CONTENTION_RETRIES: u32 = 8;

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Store-wide bookkeeping kept next to the tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Next sequence number handed out by `create`.
    #[serde(default)]
    pub next_id: u64,
    /// Bumped on every replace of the whole store.
    #[serde(default)]
    pub revision: u64,
}

/// A complete, consistent view of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Unscheduled ideas, kept verbatim.
    #[serde(default)]
    pub backlog: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Snapshot {
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    pub fn with_status(&self, status: Status) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.status == status)
    }

    /// The open remediation task created for the current BLOCKED episode of
    /// `blocked`, if any. Remediations from earlier episodes, or ones already
    /// completed or rejected, do not count.
    pub fn remediation_for(&self, blocked: &Task) -> Option<&Task> {
        self.tasks.iter().find(|t| {
            t.origin.as_ref() == Some(&blocked.id)
                && t.origin_episode == Some(blocked.status_since)
                && !t.status.is_terminal()
        })
    }

    /// Next id: past both the persisted counter and every id in the file,
    /// so ids are never reused even if the file was edited by hand.
    fn next_task_id(&self) -> (TaskId, u64) {
        let highest = self.tasks.iter().filter_map(|t| t.id.seq()).max().unwrap_or(0);
        let seq = self.metadata.next_id.max(highest + 1).max(1);
        (TaskId::from_seq(seq), seq + 1)
    }

    /// Reject unknown ids, self-references and cycles.
    fn check_dependencies(&self, id: &TaskId, deps: &BTreeSet<TaskId>) -> Result<(), StoreError> {
        for dep in deps {
            if dep == id {
                return Err(StoreError::Integrity(format!("{id} cannot depend on itself")));
            }
            if self.get(dep).is_none() {
                return Err(StoreError::Integrity(format!("{id} depends on unknown task {dep}")));
            }
            if self.reaches(dep, id) {
                return Err(StoreError::Integrity(format!(
                    "dependency {id} -> {dep} would create a cycle"
                )));
            }
        }
        Ok(())
    }

    /// Whether `target` is reachable from `from` along dependency edges.
    fn reaches(&self, from: &TaskId, target: &TaskId) -> bool {
        let mut stack = vec![from.clone()];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if &id == target {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(task) = self.get(&id) {
                stack.extend(task.dependencies.iter().cloned());
            }
        }
        false
    }

    fn apply_create(&mut self, new: NewTask, now: DateTime<Utc>) -> Result<Task, StoreError> {
        if new.title.trim().is_empty() {
            return Err(StoreError::Integrity("task title must not be empty".into()));
        }
        if let Some(role) = new.assigned
            && !role.is_agent()
        {
            return Err(StoreError::Integrity(format!("{role} cannot be assigned tasks")));
        }
        let (id, next) = self.next_task_id();
        self.check_dependencies(&id, &new.dependencies)?;

        let task = Task {
            id,
            title: new.title,
            description: new.description,
            technical_notes: new.technical_notes,
            status: Status::Todo,
            assigned: new.assigned,
            priority: new.priority,
            dependencies: new.dependencies,
            version: 1,
            status_since: 1,
            blocked_from: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            files_changed: new.files_changed,
            origin: new.origin,
            origin_episode: new.origin_episode,
        };
        self.metadata.next_id = next;
        self.tasks.push(task.clone());
        Ok(task)
    }

    fn apply_mutation(
        &mut self,
        id: &TaskId,
        mutation: &Mutation,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let current = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                task: id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut next = self.mutate(current, mutation, now)?;
        next.version = expected_version + 1;
        next.updated_at = now;
        if next.status != current.status {
            next.status_since = next.version;
        }
        let slot = self
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        *slot = next.clone();
        Ok(next)
    }

    /// Compute the mutated task without touching the snapshot.
    fn mutate(
        &self,
        current: &Task,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let id = &current.id;
        let next = match mutation {
            Mutation::Transition(req) => state::transition(current, req, self, now)?,
            Mutation::Assign(role) => {
                if let Some(r) = role
                    && !r.is_agent()
                {
                    return Err(StoreError::Integrity(format!("{r} cannot be assigned tasks")));
                }
                let mut t = current.clone();
                t.assigned = *role;
                t
            }
            Mutation::SetPriority(priority) => {
                let mut t = current.clone();
                t.priority = *priority;
                t
            }
            Mutation::AppendNote { actor, note } => {
                let mut t = current.clone();
                t.append_note(*actor, note, now);
                t
            }
            Mutation::RecordFiles(files) => {
                let mut t = current.clone();
                t.files_changed.extend(files.iter().cloned());
                t
            }
            Mutation::SetDependencies(deps) => {
                if current.status != Status::Todo {
                    return Err(StoreError::Integrity(format!(
                        "dependencies of {id} are frozen in {}",
                        current.status
                    )));
                }
                self.check_dependencies(id, deps)?;
                let mut t = current.clone();
                t.dependencies = deps.clone();
                t
            }
            Mutation::Batch(steps) => {
                let mut t = current.clone();
                for step in steps {
                    t = self.mutate(&t, step, now)?;
                }
                t
            }
        };
        Ok(next)
    }
}

impl DependencyView for Snapshot {
    fn status_of(&self, id: &TaskId) -> Option<Status> {
        self.get(id).map(|t| t.status)
    }
}

// ─── Mutations ───────────────────────────────────────────────────────────────

/// A change to one task. Status changes are only possible through
/// `Transition`, which defers to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Transition(TransitionRequest),
    Assign(Option<Role>),
    SetPriority(Priority),
    AppendNote { actor: Role, note: String },
    RecordFiles(BTreeSet<String>),
    /// Only while the task is still in TODO.
    SetDependencies(BTreeSet<TaskId>),
    /// Several changes applied in order as one write. If any step is
    /// refused, none of them is applied.
    Batch(Vec<Mutation>),
}

// ─── Store contract ──────────────────────────────────────────────────────────

pub trait TaskStore: Send + Sync {
    /// A full, consistent snapshot.
    fn read(&self) -> Result<Snapshot, StoreError>;

    /// Apply `mutation` to `id` if its stored version is `expected_version`.
    /// On success the task's version has been incremented by one.
    fn write(
        &self,
        id: &TaskId,
        mutation: &Mutation,
        expected_version: u64,
    ) -> Result<Task, StoreError>;

    /// Create a task in TODO with a freshly assigned id.
    fn create(&self, new: NewTask) -> Result<Task, StoreError>;
}

/// Read-modify-write with a bounded number of retries on version conflicts.
/// The mutation is revalidated against the fresh task on every attempt.
pub fn update<S>(
    store: &S,
    id: &TaskId,
    mutation: &Mutation,
    retries: u32,
) -> Result<Task, StoreError>
where
    S: TaskStore + ?Sized,
{
    let mut attempt = 0;
    loop {
        let snapshot = store.read()?;
        let current = snapshot
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        match store.write(id, mutation, current.version) {
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                warn!(task_id = %id, attempt, error = %e, "Retrying task write");
            }
            other => return other,
        }
    }
}

// ─── JSON file backend ───────────────────────────────────────────────────────

/// Task store backed by a single JSON file.
pub struct JsonTaskStore {
    path: PathBuf,
    /// Serializes writers inside this process; other processes are kept
    /// honest by the version and revision checks.
    writer: Mutex<()>,
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl JsonTaskStore {
    /// Open the store at `path`. A missing file reads as an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        Ok(JsonTaskStore {
            path,
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Snapshot, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(s) if s.trim().is_empty() => Ok(Snapshot::default()),
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::default()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    /// Load, apply `f`, and atomically replace the file. If another writer
    /// replaced the file in the meantime the whole step is recomputed on the
    /// fresh contents, so their change is never overwritten.
    fn commit<T>(
        &self,
        mut f: impl FnMut(&mut Snapshot) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.writer.lock();
        for attempt in 0..CONTENTION_RETRIES {
            let mut snapshot = self.load()?;
            let base_revision = snapshot.metadata.revision;
            let out = f(&mut snapshot)?;
            snapshot.metadata.revision = base_revision + 1;
            snapshot.metadata.last_updated = Some(Utc::now());

            let tmp = self.write_side_file(&snapshot)?;
            let on_disk = self.load()?.metadata.revision;
            if on_disk != base_revision {
                let _ = fs::remove_file(&tmp);
                debug!(
                    attempt,
                    base_revision,
                    on_disk,
                    "Task file replaced concurrently, recomputing"
                );
                continue;
            }
            fs::rename(&tmp, &self.path).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                StoreError::io(&self.path, e)
            })?;
            return Ok(out);
        }
        Err(StoreError::Contended {
            retries: CONTENTION_RETRIES,
        })
    }

    fn write_side_file(&self, snapshot: &Snapshot) -> Result<PathBuf, StoreError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tasks.json".to_string());
        let tmp = self.path.with_file_name(format!(
            ".{file_name}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let result = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
        });
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(&tmp, e));
        }
        Ok(tmp)
    }
}

impl TaskStore for JsonTaskStore {
    fn read(&self) -> Result<Snapshot, StoreError> {
        self.load()
    }

    fn write(
        &self,
        id: &TaskId,
        mutation: &Mutation,
        expected_version: u64,
    ) -> Result<Task, StoreError> {
        let task = self.commit(|snapshot| {
            snapshot.apply_mutation(id, mutation, expected_version, Utc::now())
        })?;
        debug!(task_id = %task.id, version = task.version, status = %task.status, "Task written");
        Ok(task)
    }

    fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        let task = self.commit(|snapshot| snapshot.apply_create(new.clone(), Utc::now()))?;
        info!(task_id = %task.id, title = %task.title, "Task created");
        Ok(task)
    }
}

// ─── In-memory backend ───────────────────────────────────────────────────────

/// Task store held in process memory.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Snapshot>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        MemoryTaskStore {
            inner: Mutex::new(snapshot),
        }
    }
}

impl TaskStore for MemoryTaskStore {
    fn read(&self) -> Result<Snapshot, StoreError> {
        Ok(self.inner.lock().clone())
    }

    fn write(
        &self,
        id: &TaskId,
        mutation: &Mutation,
        expected_version: u64,
    ) -> Result<Task, StoreError> {
        let mut guard = self.inner.lock();
        // Work on a copy so a refused mutation leaves nothing behind.
        let mut next = guard.clone();
        let task = next.apply_mutation(id, mutation, expected_version, Utc::now())?;
        next.metadata.revision += 1;
        next.metadata.last_updated = Some(Utc::now());
        *guard = next;
        Ok(task)
    }

    fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        let mut guard = self.inner.lock();
        let mut next = guard.clone();
        let task = next.apply_create(new, Utc::now())?;
        next.metadata.revision += 1;
        next.metadata.last_updated = Some(Utc::now());
        *guard = next;
        Ok(task)
    }
}
