//! Change detector.
//!
//! Polls the task store on a fixed interval, diffs each task against the
//! last state it successfully acted on, and hands the resulting events to the
//! dispatcher. The per-task watermark only moves forward once an event has
//! been delivered (or needed no delivery), so a dropped notification is
//! derived again on the next cycle.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::dispatch::{ChangeEvent, Delivery, Dispatcher};
use crate::error::StoreError;
use crate::state::TransitionRequest;
use crate::store::{update, Mutation, Snapshot, TaskStore};
use crate::task::{Role, Status, Task, TaskId};

// ─── Watermark ───────────────────────────────────────────────────────────────

/// What the watcher last acted on for one task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Seen {
    pub version: u64,
    pub status: Status,
    pub assigned: Option<Role>,
}

impl Seen {
    fn of(task: &Task) -> Self {
        Seen {
            version: task.version,
            status: task.status,
            assigned: task.assigned,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    /// False until a baseline has been adopted.
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, Seen>,
}

impl Watermark {
    /// Load from disk; a missing file is an uninitialised watermark.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Atomically replace the file at `path`.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, raw).map_err(|e| StoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
    }

    fn adopt(&mut self, snapshot: &Snapshot) {
        self.tasks = snapshot
            .tasks
            .iter()
            .map(|t| (t.id.clone(), Seen::of(t)))
            .collect();
        self.initialized = true;
    }
}

// ─── Watcher ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub poll_interval: Duration,
    /// Longest a task may sit in WIP. `None` disables escalation.
    pub max_wip: Option<Duration>,
    pub write_retries: u32,
    /// Where the watermark is persisted. `None` keeps it in memory only.
    pub state_path: Option<PathBuf>,
    /// Adopt the current snapshot without dispatching on first start.
    pub baseline_on_start: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        WatcherOptions {
            poll_interval: Duration::from_secs(2),
            max_wip: Some(Duration::from_secs(3600)),
            write_retries: 5,
            state_path: None,
            baseline_on_start: true,
        }
    }
}

/// Summary of one polling cycle.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    /// The cycle only adopted a baseline.
    pub baselined: bool,
    pub events: Vec<ChangeEvent>,
    pub delivered: usize,
    pub dropped: usize,
    /// Tasks moved from WIP to BLOCKED for exceeding their time limit.
    pub escalated: Vec<TaskId>,
}

pub struct Watcher {
    store: Arc<dyn TaskStore>,
    dispatcher: Dispatcher,
    options: WatcherOptions,
    watermark: Watermark,
}

impl Watcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Dispatcher,
        options: WatcherOptions,
    ) -> Result<Self, StoreError> {
        let watermark = match &options.state_path {
            Some(path) => Watermark::load(path)?,
            None => Watermark::default(),
        };
        Ok(Watcher {
            store,
            dispatcher,
            options,
            watermark,
        })
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    /// One poll, escalate, diff and dispatch cycle.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<CycleReport, StoreError> {
        let mut snapshot = self.store.read()?;
        let mut report = CycleReport::default();

        if !self.watermark.initialized {
            if self.options.baseline_on_start {
                self.watermark.adopt(&snapshot);
                self.persist()?;
                info!(tasks = snapshot.tasks.len(), "Adopted baseline snapshot");
                report.baselined = true;
                return Ok(report);
            }
            self.watermark.initialized = true;
        }

        report.escalated = self.escalate_stalled(&snapshot, now);
        if !report.escalated.is_empty() {
            snapshot = self.store.read()?;
        }

        let events = self.diff(&snapshot, now);
        let deliveries = self.dispatcher.dispatch_batch(&events).await;
        for (event, delivery) in events.iter().zip(&deliveries) {
            match delivery {
                Delivery::Delivered(_) => report.delivered += 1,
                Delivery::Dropped { .. } => report.dropped += 1,
                Delivery::Duplicate(_) | Delivery::NoRecipient => {}
            }
            if delivery.is_settled() {
                self.watermark.tasks.insert(
                    event.task_id.clone(),
                    Seen {
                        version: event.version,
                        status: event.new_status,
                        assigned: event.new_assigned,
                    },
                );
            }
        }

        // Version bumps without a routing change (notes, priority, files).
        for task in &snapshot.tasks {
            if let Some(seen) = self.watermark.tasks.get_mut(&task.id)
                && seen.version != task.version
                && seen.status == task.status
                && seen.assigned == task.assigned
            {
                seen.version = task.version;
            }
        }
        self.watermark
            .tasks
            .retain(|id, _| snapshot.get(id).is_some());

        self.persist()?;
        report.events = events;
        Ok(report)
    }

    /// Poll until `shutdown` resolves. Cycle failures are logged and the
    /// loop carries on.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(interval = ?self.options.poll_interval, "Watcher started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Watcher stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) if !report.events.is_empty() || !report.escalated.is_empty() => {
                            debug!(
                                events = report.events.len(),
                                delivered = report.delivered,
                                dropped = report.dropped,
                                escalated = report.escalated.len(),
                                "Cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Watcher cycle failed"),
                    }
                }
            }
        }
    }

    fn diff(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for task in &snapshot.tasks {
            let seen = self.watermark.tasks.get(&task.id);
            if let Some(seen) = seen
                && (seen.version == task.version
                    || (seen.status == task.status && seen.assigned == task.assigned))
            {
                continue;
            }
            events.push(ChangeEvent {
                task_id: task.id.clone(),
                title: task.title.clone(),
                version: task.version,
                previous_status: seen.map(|s| s.status),
                previous_assigned: seen.and_then(|s| s.assigned),
                new_status: task.status,
                new_assigned: task.assigned,
                observed_at: now,
            });
        }
        events
    }

    fn escalate_stalled(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<TaskId> {
        let Some(max_wip) = self.options.max_wip else {
            return Vec::new();
        };
        let mut escalated = Vec::new();
        for task in snapshot.with_status(Status::Wip) {
            let started = task.started_at.unwrap_or(task.updated_at);
            let Ok(elapsed) = (now - started).to_std() else {
                continue;
            };
            if elapsed < max_wip {
                continue;
            }
            let reason = format!(
                "Timed out: in WIP for {}s (limit {}s)",
                elapsed.as_secs(),
                max_wip.as_secs()
            );
            let mutation = Mutation::Transition(
                TransitionRequest::new(Status::Blocked, Role::Watcher).with_note(reason),
            );
            match update(self.store.as_ref(), &task.id, &mutation, self.options.write_retries) {
                Ok(t) => {
                    let elapsed_secs = elapsed.as_secs();
                    warn!(task_id = %t.id, elapsed_secs, "Stalled task blocked");
                    escalated.push(t.id);
                }
                // Someone else moved it on first.
                Err(StoreError::Transition(e)) => {
                    debug!(task_id = %task.id, error = %e, "Skipped timeout escalation");
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Timeout escalation failed"),
            }
        }
        escalated
    }

    fn persist(&self) -> Result<(), StoreError> {
        match &self.options.state_path {
            Some(path) => self.watermark.save(path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RecordingNotifier;
    use crate::store::MemoryTaskStore;
    use crate::task::NewTask;

    fn watcher(
        store: Arc<MemoryTaskStore>,
        notifier: Arc<RecordingNotifier>,
        opts: WatcherOptions,
    ) -> Watcher {
        let dispatcher = Dispatcher::new(notifier, Duration::from_secs(30));
        Watcher::new(store, dispatcher, opts).unwrap()
    }

    fn no_baseline() -> WatcherOptions {
        WatcherOptions {
            baseline_on_start: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_start_adopts_baseline() {
        let store = Arc::new(MemoryTaskStore::new());
        store.create(NewTask::new("existing").assigned(Role::Dev1)).unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let mut w = watcher(store.clone(), notifier.clone(), WatcherOptions::default());

        let report = w.run_once(Utc::now()).await.unwrap();
        assert!(report.baselined);
        assert!(notifier.sent().is_empty());

        let report = w.run_once(Utc::now()).await.unwrap();
        assert!(report.events.is_empty());
    }

    #[tokio::test]
    async fn new_task_notifies_assignee() {
        let store = Arc::new(MemoryTaskStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let mut w = watcher(store.clone(), notifier.clone(), no_baseline());

        store.create(NewTask::new("feature").assigned(Role::Dev2)).unwrap();
        let report = w.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].previous_status, None);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Role::Dev2);
    }

    #[tokio::test]
    async fn unchanged_version_is_skipped() {
        let store = Arc::new(MemoryTaskStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let mut w = watcher(store.clone(), notifier.clone(), no_baseline());
        store.create(NewTask::new("feature").assigned(Role::Dev1)).unwrap();

        w.run_once(Utc::now()).await.unwrap();
        let report = w.run_once(Utc::now()).await.unwrap();
        assert!(report.events.is_empty());
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn note_only_changes_do_not_notify() {
        let store = Arc::new(MemoryTaskStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let mut w = watcher(store.clone(), notifier.clone(), no_baseline());
        let t = store.create(NewTask::new("feature").assigned(Role::Dev1)).unwrap();
        w.run_once(Utc::now()).await.unwrap();

        let note = Mutation::AppendNote {
            actor: Role::Dev1,
            note: "halfway".into(),
        };
        store.write(&t.id, &note, 1).unwrap();
        let report = w.run_once(Utc::now()).await.unwrap();
        assert!(report.events.is_empty());
        assert_eq!(w.watermark().tasks[&t.id].version, 2);
    }

    #[tokio::test]
    async fn dropped_delivery_is_retried_next_cycle() {
        let store = Arc::new(MemoryTaskStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.set_unreachable(Role::Dev1, true);
        let mut w = watcher(store.clone(), notifier.clone(), no_baseline());
        store.create(NewTask::new("feature").assigned(Role::Dev1)).unwrap();

        let report = w.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(w.watermark().tasks.is_empty());

        notifier.set_unreachable(Role::Dev1, false);
        let report = w.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn stalled_wip_is_blocked_once() {
        let store = Arc::new(MemoryTaskStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let opts = WatcherOptions {
            max_wip: Some(Duration::from_secs(60)),
            ..no_baseline()
        };
        let mut w = watcher(store.clone(), notifier.clone(), opts);
        let t = store.create(NewTask::new("slow").assigned(Role::Dev1)).unwrap();
        let start = Mutation::Transition(TransitionRequest::new(Status::Wip, Role::Dev1));
        store.write(&t.id, &start, 1).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        let report = w.run_once(later).await.unwrap();
        assert_eq!(report.escalated, vec![t.id.clone()]);
        let blocked = store.read().unwrap().get(&t.id).cloned().unwrap();
        assert_eq!(blocked.status, Status::Blocked);
        assert!(blocked.technical_notes.contains("Timed out"));
        assert!(notifier.sent().iter().any(|(r, _)| *r == Role::Taskmaster));

        let report = w.run_once(later).await.unwrap();
        assert!(report.escalated.is_empty());
    }

    #[tokio::test]
    async fn watermark_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTaskStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let opts = WatcherOptions {
            state_path: Some(dir.path().join("watcher_state.json")),
            ..no_baseline()
        };
        store.create(NewTask::new("feature").assigned(Role::Dev1)).unwrap();

        let mut w = watcher(store.clone(), notifier.clone(), opts.clone());
        w.run_once(Utc::now()).await.unwrap();
        drop(w);

        let mut w = watcher(store.clone(), notifier.clone(), opts);
        let report = w.run_once(Utc::now()).await.unwrap();
        assert!(report.events.is_empty());
        assert_eq!(notifier.sent().len(), 1);
    }
}
