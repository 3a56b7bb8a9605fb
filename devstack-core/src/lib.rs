//! devstack-core: coordination core for a team of development agents.
//!
//! Tasks move through a fixed pipeline (TODO, WIP, TESTING, REVIEW,
//! APPROVED, COMPLETED) owned by different agent roles:
//! - Task store: versioned, atomically replaced JSON file
//! - State machine: the only way a task's status changes
//! - Watcher + dispatcher: poll for changes, notify the next agent
//! - Context manager: bounded per-(task, agent) conversation memory
//! - Conflict resolver: blocks a task that failed integration and opens a
//!   remediation task for it

pub mod config;
pub mod conflict;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod inbox;
pub mod report;
pub mod state;
pub mod store;
pub mod task;
pub mod watcher;

pub use config::Config;
pub use error::{StoreError, TransitionError};
pub use state::{Outcome, TransitionRequest};
pub use store::{JsonTaskStore, MemoryTaskStore, Mutation, Snapshot, TaskStore};
pub use task::{NewTask, Priority, Role, Status, Task, TaskId};
