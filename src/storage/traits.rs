//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::storage::models::{
    Item, ItemFilter, ItemStatus, Progress, Task, TaskFilter, TaskStatus,
};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("MySQL error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Storage has been closed")]
    Closed,

    #[error("Storage lock poisoned")]
    Lock,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound(_) | Self::ItemNotFound(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Backends are shared between the orchestrator and the fetch callbacks, so every
/// method takes `&self` and implementations synchronize internally.
pub trait Storage: Send + Sync {
    // ===== Task Management =====

    /// Inserts a task, assigning an id if it has none
    fn save_task(&self, task: &mut Task) -> StorageResult<()>;

    /// Gets a task by id
    fn get_task(&self, id: &str) -> StorageResult<Task>;

    /// Gets the earliest-created task with this exact URL
    fn get_task_by_url(&self, url: &str) -> StorageResult<Task>;

    /// Gets the earliest-created task with this URL digest
    fn get_task_by_url_hash(&self, url_hash: &str) -> StorageResult<Task>;

    /// Overwrites every column of an existing task and bumps `updated_at`
    fn update_task(&self, task: &mut Task) -> StorageResult<()>;

    /// Sets a task's status, keeping `completed_at` in step
    fn update_task_status(&self, id: &str, status: TaskStatus) -> StorageResult<()>;

    /// Deletes a task; deleting a missing id is not an error
    fn delete_task(&self, id: &str) -> StorageResult<()>;

    fn list_tasks(&self, filter: &TaskFilter) -> StorageResult<Vec<Task>>;

    /// Counts matching tasks, ignoring ordering and paging
    fn count_tasks(&self, filter: &TaskFilter) -> StorageResult<u64>;

    /// Inserts several tasks atomically
    fn save_tasks(&self, tasks: &mut [Task]) -> StorageResult<()>;

    // ===== Item Management =====

    fn save_item(&self, item: &mut Item) -> StorageResult<()>;

    fn get_item(&self, id: &str) -> StorageResult<Item>;

    /// Gets the earliest-created item with this content digest
    fn get_item_by_content_hash(&self, content_hash: &str) -> StorageResult<Item>;

    fn update_item_status(&self, id: &str, status: ItemStatus) -> StorageResult<()>;

    fn list_items(&self, filter: &ItemFilter) -> StorageResult<Vec<Item>>;

    fn count_items(&self, filter: &ItemFilter) -> StorageResult<u64>;

    fn delete_item(&self, id: &str) -> StorageResult<()>;

    // ===== Maintenance =====

    /// Computes progress from the current task population
    fn progress(&self) -> StorageResult<Progress>;

    /// Removes every item and task in one transaction
    fn clear(&self) -> StorageResult<()>;

    /// Releases the backend; later calls fail with [`StorageError::Closed`]
    fn close(&self) -> StorageResult<()>;
}
