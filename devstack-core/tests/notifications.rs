//! Watcher, dispatcher and inbox working together.
//!
//! Tests cover:
//! - A full pipeline run notifying each role in turn
//! - Replayed change events never producing a second transition
//! - Notes written after a handoff not invalidating the hint
//! - Delivery through the file notifier into an agent inbox

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use devstack_core::dispatch::{Delivery, Dispatcher, FileNotifier, Notification, RecordingNotifier};
use devstack_core::inbox::{Inbox, Verdict};
use devstack_core::watcher::{Watcher, WatcherOptions};
use devstack_core::{
    MemoryTaskStore, Mutation, NewTask, Role, StoreError, Status, TaskStore, TransitionRequest,
};

fn options() -> WatcherOptions {
    WatcherOptions {
        baseline_on_start: false,
        max_wip: None,
        ..Default::default()
    }
}

fn transition(store: &MemoryTaskStore, id: &devstack_core::TaskId, req: TransitionRequest) {
    let version = store.read().unwrap().get(id).unwrap().version;
    store.write(id, &Mutation::Transition(req), version).unwrap();
}

#[tokio::test]
async fn each_stage_notifies_the_next_role() {
    let store = Arc::new(MemoryTaskStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let dispatcher = Dispatcher::new(notifier.clone(), Duration::from_secs(30));
    let mut watcher = Watcher::new(store.clone(), dispatcher, options()).unwrap();

    let task = store.create(NewTask::new("Profile page").assigned(Role::Dev1)).unwrap();
    watcher.run_once(Utc::now()).await.unwrap();

    let stages = [
        TransitionRequest::new(Status::Wip, Role::Dev1),
        TransitionRequest::new(Status::Testing, Role::Dev1),
        TransitionRequest::new(Status::Review, Role::Testing).passed(),
        TransitionRequest::new(Status::Approved, Role::Review),
        TransitionRequest::new(Status::Completed, Role::DevOps).passed(),
    ];
    for req in stages {
        transition(&store, &task.id, req);
        watcher.run_once(Utc::now()).await.unwrap();
    }

    let roles: Vec<Role> = notifier.sent().into_iter().map(|(r, _)| r).collect();
    assert_eq!(
        roles,
        vec![Role::Dev1, Role::Dev1, Role::Testing, Role::Review, Role::DevOps]
    );
}

#[tokio::test]
async fn replayed_event_never_repeats_a_transition() {
    let store = Arc::new(MemoryTaskStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let dispatcher = Dispatcher::new(notifier.clone(), Duration::from_secs(30));
    let mut watcher = Watcher::new(store.clone(), dispatcher, options()).unwrap();

    let task = store.create(NewTask::new("Export CSV").assigned(Role::Dev1)).unwrap();
    transition(&store, &task.id, TransitionRequest::new(Status::Wip, Role::Dev1));
    transition(&store, &task.id, TransitionRequest::new(Status::Testing, Role::Dev1));
    let report = watcher.run_once(Utc::now()).await.unwrap();
    let event = report.events[0].clone();

    // The dispatcher suppresses the replay outright.
    let replay = Dispatcher::new(notifier.clone(), Duration::from_secs(30));
    assert_eq!(replay.dispatch(&event).await, Delivery::Delivered(Role::Testing));
    assert_eq!(replay.dispatch(&event).await, Delivery::Duplicate(Role::Testing));

    // An agent that receives it anyway re-validates and acts only once.
    let dir = tempfile::tempdir().unwrap();
    let mut inbox = Inbox::new(dir.path(), Role::Testing);
    let n = Notification::from_event(&event);
    let mut transitions = 0;
    for _ in 0..3 {
        if let Verdict::Actionable(t) = inbox.validate(store.as_ref(), &n).unwrap() {
            let req = TransitionRequest::new(Status::Review, Role::Testing).passed();
            store.write(&t.id, &Mutation::Transition(req), t.version).unwrap();
            transitions += 1;
        }
    }
    assert_eq!(transitions, 1);

    // A fresh agent process with no memory of it sees a stale hint.
    let mut fresh = Inbox::new(dir.path(), Role::Testing);
    assert!(matches!(fresh.validate(store.as_ref(), &n).unwrap(), Verdict::Stale { .. }));

    // And a blind retry of the same transition is refused by the store.
    let req = TransitionRequest::new(Status::Review, Role::Testing).passed();
    let err = store.write(&task.id, &Mutation::Transition(req), event.version).unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { .. }));
    assert_eq!(store.read().unwrap().get(&task.id).unwrap().status, Status::Review);
}

#[tokio::test]
async fn file_notifier_feeds_the_agent_inbox() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryTaskStore::new());
    let notifier = Arc::new(FileNotifier::new(dir.path()));
    let dispatcher = Dispatcher::new(notifier, Duration::from_secs(30));
    let mut watcher = Watcher::new(store.clone(), dispatcher, options()).unwrap();
    let mut dev_inbox = Inbox::new(dir.path(), Role::Dev2);
    let mut testing_inbox = Inbox::new(dir.path(), Role::Testing);

    let task = store.create(NewTask::new("Dark mode").assigned(Role::Dev2)).unwrap();
    watcher.run_once(Utc::now()).await.unwrap();

    let got = dev_inbox.poll().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].task_id, task.id);
    assert!(matches!(dev_inbox.validate(store.as_ref(), &got[0]).unwrap(), Verdict::Actionable(_)));
    assert!(testing_inbox.poll().unwrap().is_empty());

    transition(&store, &task.id, TransitionRequest::new(Status::Wip, Role::Dev2));
    transition(&store, &task.id, TransitionRequest::new(Status::Testing, Role::Dev2));
    watcher.run_once(Utc::now()).await.unwrap();

    let got = testing_inbox.poll().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].new_status, Status::Testing);
}

#[tokio::test]
async fn note_after_handoff_leaves_hint_actionable() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryTaskStore::new());
    let notifier = Arc::new(FileNotifier::new(dir.path()));
    let dispatcher = Dispatcher::new(notifier, Duration::from_secs(30));
    let mut watcher = Watcher::new(store.clone(), dispatcher, options()).unwrap();
    let mut inbox = Inbox::new(dir.path(), Role::Testing);

    let task = store.create(NewTask::new("Search box").assigned(Role::Dev1)).unwrap();
    transition(&store, &task.id, TransitionRequest::new(Status::Wip, Role::Dev1));
    transition(&store, &task.id, TransitionRequest::new(Status::Testing, Role::Dev1));
    watcher.run_once(Utc::now()).await.unwrap();

    // Dev1 adds a note before Testing gets to its inbox.
    let version = store.read().unwrap().get(&task.id).unwrap().version;
    let note = Mutation::AppendNote {
        actor: Role::Dev1,
        note: "covered the empty query case".into(),
    };
    store.write(&task.id, &note, version).unwrap();

    let mut actionable = Vec::new();
    for _ in 0..3 {
        watcher.run_once(Utc::now()).await.unwrap();
        for n in inbox.poll().unwrap() {
            if let Verdict::Actionable(t) = inbox.validate(store.as_ref(), &n).unwrap() {
                actionable.push(t);
            }
        }
    }
    assert_eq!(actionable.len(), 1);
    assert_eq!(actionable[0].status, Status::Testing);
    assert_eq!(actionable[0].version, version + 1);

    let req = TransitionRequest::new(Status::Review, Role::Testing).passed();
    let t = store
        .write(&task.id, &Mutation::Transition(req), actionable[0].version)
        .unwrap();
    assert_eq!(t.status, Status::Review);
}
