//! Error taxonomy for task mutations.
//!
//! `VersionConflict` is the only retryable variant. Everything else is
//! permanent for the given input and must reach the caller.

use std::path::PathBuf;

use crate::task::{Role, Status, TaskId};

/// A transition refused by the state machine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition for {task}: {from} -> {to} by {actor} ({reason})")]
    Illegal {
        task: TaskId,
        from: Status,
        to: Status,
        actor: Role,
        reason: String,
    },
    #[error("{task} cannot leave TODO: waiting on {}", describe_pending(.pending))]
    DependencyUnsatisfied {
        task: TaskId,
        /// Each unmet dependency with its current status (`None` if unknown).
        pending: Vec<(TaskId, Option<Status>)>,
    },
}

fn describe_pending(pending: &[(TaskId, Option<Status>)]) -> String {
    pending
        .iter()
        .map(|(id, status)| match status {
            Some(s) => format!("{id} ({s})"),
            None => format!("{id} (missing)"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict on {task}: expected {expected}, stored {actual}")]
    VersionConflict {
        task: TaskId,
        expected: u64,
        actual: u64,
    },
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store changed underneath the write {retries} times")]
    Contended { retries: u32 },
}

impl StoreError {
    /// Whether re-reading and retrying could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. } | StoreError::Contended { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
