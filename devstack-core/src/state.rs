//! Pipeline state machine.
//!
//! Every status change in the system goes through [`transition`]. It is a
//! pure function: given the current task, a requested move and a view of the
//! other tasks' statuses it either returns the updated task or explains why
//! the move is refused. Version bumps and persistence belong to the store.

use chrono::{DateTime, Utc};

use crate::error::TransitionError;
use crate::task::{Role, Status, Task, TaskId};

/// Result reported by the actor alongside a transition (tests, integration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
}

/// A requested status change.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub to: Status,
    pub actor: Role,
    pub outcome: Option<Outcome>,
    /// Free text appended to the task's technical notes.
    pub note: Option<String>,
}

impl TransitionRequest {
    pub fn new(to: Status, actor: Role) -> Self {
        TransitionRequest {
            to,
            actor,
            outcome: None,
            note: None,
        }
    }

    pub fn passed(mut self) -> Self {
        self.outcome = Some(Outcome::Passed);
        self
    }

    pub fn failed(mut self, note: impl Into<String>) -> Self {
        self.outcome = Some(Outcome::Failed);
        self.note = Some(note.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Read access to the statuses of other tasks, for dependency checks.
pub trait DependencyView {
    fn status_of(&self, id: &TaskId) -> Option<Status>;
}

impl<F> DependencyView for F
where
    F: Fn(&TaskId) -> Option<Status>,
{
    fn status_of(&self, id: &TaskId) -> Option<Status> {
        self(id)
    }
}

/// Dependencies of `task` that are not COMPLETED, with their current status.
pub fn pending_dependencies(
    task: &Task,
    deps: &impl DependencyView,
) -> Vec<(TaskId, Option<Status>)> {
    task.dependencies
        .iter()
        .filter_map(|id| match deps.status_of(id) {
            Some(Status::Completed) => None,
            other => Some((id.clone(), other)),
        })
        .collect()
}

/// Apply `req` to `task`, returning the updated task.
pub fn transition(
    task: &Task,
    req: &TransitionRequest,
    deps: &impl DependencyView,
    now: DateTime<Utc>,
) -> Result<Task, TransitionError> {
    use Status::*;

    let from = task.status;
    let actor = req.actor;
    let illegal = |reason: &str| TransitionError::Illegal {
        task: task.id.clone(),
        from,
        to: req.to,
        actor,
        reason: reason.to_string(),
    };
    let is_assignee = task.assigned == Some(actor);
    let note = req.note.as_deref().map(str::trim).filter(|n| !n.is_empty());

    let mut next = task.clone();

    if req.to == Rejected {
        if from == Rejected {
            return Err(illegal("task is already rejected"));
        }
        if !actor.is_supervisor() {
            return Err(illegal("only the Taskmaster or a human may reject a task"));
        }
        let reason = note.unwrap_or("no reason given");
        next.append_note(actor, &format!("Rejected: {reason}"), now);
        next.status = Rejected;
        next.blocked_from = None;
        return Ok(next);
    }

    match (from, req.to) {
        (Todo, Wip) => {
            if !is_assignee {
                return Err(illegal("only the assigned agent may start a task"));
            }
            let pending = pending_dependencies(task, deps);
            if !pending.is_empty() {
                return Err(TransitionError::DependencyUnsatisfied {
                    task: task.id.clone(),
                    pending,
                });
            }
            next.started_at = Some(now);
        }
        (Wip, Testing) => {
            if !is_assignee {
                return Err(illegal("only the assigned agent may hand off to testing"));
            }
        }
        (Testing, Review) => {
            if actor != Role::Testing {
                return Err(illegal("only the Testing role may pass a task to review"));
            }
            if req.outcome != Some(Outcome::Passed) {
                return Err(illegal("tests must be reported passing"));
            }
        }
        (Testing, Todo) => {
            if actor != Role::Testing {
                return Err(illegal("only the Testing role may send a task back"));
            }
            if req.outcome != Some(Outcome::Failed) {
                return Err(illegal("tests must be reported failing"));
            }
            let details = note.unwrap_or("no details");
            next.append_note(actor, &format!("Tests failed: {details}"), now);
        }
        (Review, Approved) => {
            if actor != Role::Review {
                return Err(illegal("only the Review role may approve"));
            }
        }
        (Review, Todo) => {
            if actor != Role::Review {
                return Err(illegal("only the Review role may request changes"));
            }
            next.append_note(
                actor,
                &format!("Changes requested: {}", note.unwrap_or("see review")),
                now,
            );
        }
        (Approved, Completed) => {
            if actor != Role::DevOps {
                return Err(illegal("only DevOps may complete an integration"));
            }
            if req.outcome != Some(Outcome::Passed) {
                return Err(illegal("integration must be reported successful"));
            }
        }
        (Approved, Blocked) => {
            if actor != Role::DevOps {
                return Err(illegal("only DevOps may report an integration conflict"));
            }
            if req.outcome != Some(Outcome::Failed) {
                return Err(illegal("integration must be reported failing"));
            }
            next.append_note(
                actor,
                &format!("Integration conflict: {}", note.unwrap_or("no details")),
                now,
            );
        }
        (Wip, Blocked) => {
            if !(is_assignee || actor == Role::Watcher || actor.is_supervisor()) {
                return Err(illegal("only the assignee, the watcher or a supervisor may block"));
            }
            let Some(reason) = note else {
                return Err(illegal("blocking requires a reason"));
            };
            next.append_note(actor, &format!("Blocked: {reason}"), now);
        }
        (Blocked, Todo) => {
            if !actor.is_supervisor() {
                return Err(illegal("only the Taskmaster or a human may unblock"));
            }
            let Some(resolution) = note else {
                return Err(illegal("unblocking requires a recorded resolution"));
            };
            next.append_note(actor, &format!("Unblocked: {resolution}"), now);
        }
        (Rejected, Todo) => {
            if !actor.is_supervisor() {
                return Err(illegal("only the Taskmaster or a human may reopen"));
            }
            let reason = note.unwrap_or("manual reopen");
            next.append_note(actor, &format!("Reopened: {reason}"), now);
        }
        _ => return Err(illegal("no such edge in the pipeline")),
    }

    next.status = req.to;
    next.blocked_from = (req.to == Blocked).then_some(from);
    Ok(next)
}

/// The role expected to act next on a task in `status`.
pub fn responsible_role(status: Status, assigned: Option<Role>) -> Option<Role> {
    match status {
        Status::Todo | Status::Wip => assigned.filter(|r| r.is_agent()),
        Status::Testing => Some(Role::Testing),
        Status::Review => Some(Role::Review),
        Status::Approved => Some(Role::DevOps),
        Status::Blocked => Some(Role::Taskmaster),
        Status::Completed | Status::Rejected => None,
    }
}
