use thiserror::Error;

use crate::partition::PartitionId;

/// An error a task reports through its callback, or returns from
/// `window`/`commit`/`endOfStream`. The run loop does not interpret these
/// beyond wrapping them in a [`RunLoopError`] and aborting; retrying is
/// the task's own responsibility.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::Failed(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::Failed(message.to_string())
    }
}

/// Fatal errors that terminate the run loop. A single failure terminates
/// the container; offsets are never advanced past a failed envelope, so
/// at-least-once delivery is preserved.
#[derive(Debug, Error)]
pub enum RunLoopError {
    #[error("task '{task}' callback failed: {source}")]
    DispatchFailed { task: String, source: TaskError },

    #[error("task '{task}' callback timed out after {timeout_ms}ms")]
    CallbackTimeout { task: String, timeout_ms: u64 },

    #[error("task '{task}' callback was dropped without completing")]
    CallbackDropped { task: String },

    #[error("task '{task}' window call failed: {source}")]
    WindowFailed { task: String, source: TaskError },

    #[error("task '{task}' commit call failed: {source}")]
    CommitFailed { task: String, source: TaskError },

    #[error("task '{task}' endOfStream call failed: {source}")]
    EndOfStreamFailed { task: String, source: TaskError },

    #[error("consumer mux failed: {0}")]
    Mux(String),

    #[error("offset update failed for task '{task}' partition {partition}: {reason}")]
    OffsetUpdate {
        task: String,
        partition: PartitionId,
        reason: String,
    },
}
