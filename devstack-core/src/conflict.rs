//! Integration failure handling.
//!
//! When DevOps cannot integrate an approved task, the task is blocked and a
//! remediation task is created that points back at it. This is the only place
//! the core creates tasks on its own. It never tries to fix the conflict.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::error::StoreError;
use crate::state::TransitionRequest;
use crate::store::{update, Mutation, TaskStore};
use crate::task::{NewTask, Role, Status, Task, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("{actor} cannot report integration failures; only DevOps can")]
    NotAuthorized { actor: Role },
    #[error("{task} is {status}; only APPROVED tasks can fail integration")]
    NotIntegrating { task: TaskId, status: Status },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub blocked: Task,
    pub remediation: Task,
    /// False when an earlier call already created the remediation task.
    pub created: bool,
}

/// Title given to every remediation task.
pub fn remediation_title(title: &str) -> String {
    format!("Resolve integration conflict: {title}")
}

/// Block `task_id` and create its remediation task.
///
/// A task that is already blocked is accepted only if that block was itself
/// an integration failure. Repeating the report within the same blocked
/// episode returns the open remediation task instead of creating another.
pub fn resolve_integration_failure<S>(
    store: &S,
    task_id: &TaskId,
    actor: Role,
    failure: &str,
    retries: u32,
) -> Result<ConflictResolution, ConflictError>
where
    S: TaskStore + ?Sized,
{
    if actor != Role::DevOps {
        return Err(ConflictError::NotAuthorized { actor });
    }

    let snapshot = store.read()?;
    let task = snapshot
        .get(task_id)
        .cloned()
        .ok_or_else(|| StoreError::NotFound(task_id.clone()))?;

    let blocked = match task.status {
        Status::Approved => {
            let request = TransitionRequest::new(Status::Blocked, actor).failed(failure);
            match update(store, task_id, &Mutation::Transition(request), retries) {
                Ok(t) => t,
                // Lost a race with another report for the same failure.
                Err(StoreError::Transition(e)) => match store.read()?.get(task_id) {
                    Some(t) if is_integration_block(t) => t.clone(),
                    _ => return Err(StoreError::Transition(e).into()),
                },
                Err(e) => return Err(e.into()),
            }
        }
        _ if is_integration_block(&task) => task,
        status => {
            return Err(ConflictError::NotIntegrating {
                task: task_id.clone(),
                status,
            });
        }
    };

    if let Some(existing) = store.read()?.remediation_for(&blocked) {
        info!(task_id = %task_id, remediation = %existing.id, "Remediation task already exists");
        return Ok(ConflictResolution {
            blocked,
            remediation: existing.clone(),
            created: false,
        });
    }

    let new = NewTask {
        title: remediation_title(&blocked.title),
        description: format!("Integration of {task_id} failed:\n{failure}"),
        technical_notes: String::new(),
        assigned: None,
        priority: blocked.priority,
        dependencies: BTreeSet::from([task_id.clone()]),
        files_changed: blocked.files_changed.clone(),
        origin: Some(task_id.clone()),
        origin_episode: Some(blocked.status_since),
    };
    let remediation = store.create(new)?;
    warn!(
        task_id = %task_id,
        remediation = %remediation.id,
        "Integration failed; task blocked and remediation created"
    );
    Ok(ConflictResolution {
        blocked,
        remediation,
        created: true,
    })
}

fn is_integration_block(task: &Task) -> bool {
    task.status == Status::Blocked && task.blocked_from == Some(Status::Approved)
}
