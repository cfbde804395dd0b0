//! # vwd-queue
//!
//! Persisted FIFO of maintenance operations (placeholder creation/deletion,
//! projection updates) that survives process restarts.
//!
//! Operations are persisted before they become visible to the worker, so a
//! crash between persist and in-memory enqueue only costs a redundant replay
//! on the next start, never a loss. The worker drains under the internal
//! side of the [`vwd_lock::ExclusionLock`], yielding to external git
//! processes when idle.

pub mod queue;
pub mod store;

pub use queue::{QueueTuning, TaskProcessor, TaskQueue, TaskResult};
pub use store::{Operation, OperationStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Journal(#[from] vwd_journal::JournalError),

    #[error("task queue is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, QueueError>;
