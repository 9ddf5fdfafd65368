//! Task and item records plus their query filters

use crate::storage::dedup::{hash_content, hash_url};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque key/value metadata attached to tasks and items
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Skipped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Paused,
        Self::Skipped,
    ];

    /// Returns true for states that record a completion time
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if a prior task in this state blocks a new submission of the same key
    ///
    /// Only in-flight and finished tasks block. Paused and skipped tasks do not.
    pub fn blocks_resubmission(&self) -> bool {
        matches!(self, Self::Completed | Self::Running)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// Kind of artifact an item holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Html,
    Image,
    File,
    Data,
}

impl ItemType {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Image => "image",
            Self::File => "file",
            Self::Data => "data",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "html" => Some(Self::Html),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "data" => Some(Self::Data),
            _ => None,
        }
    }

    /// Classifies a response by its Content-Type header
    pub fn from_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if mime.contains("html") {
            Self::Html
        } else if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("text/") || mime.contains("json") || mime.contains("xml") {
            Self::Data
        } else {
            Self::File
        }
    }
}

/// Persistence status of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Saved,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Saved => "saved",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "saved" => Some(Self::Saved),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// One discovered URL to fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub url: String,
    pub url_hash: String,
    pub method: String,
    pub priority: i32,
    pub depth: u32,
    pub status: TaskStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a pending GET task with a fresh id
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url_hash: hash_url(&url),
            url,
            method: "GET".to_string(),
            priority: 0,
            depth: 0,
            status: TaskStatus::Pending,
            retries: 0,
            max_retries: 0,
            error: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Moves the task to `status`, keeping `completed_at` in step
    ///
    /// `completed_at` is set on entering a terminal state and cleared when the
    /// task leaves one.
    pub fn set_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        if status.is_terminal() {
            if !self.status.is_terminal() || self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        } else {
            self.completed_at = None;
        }
        self.status = status;
        self.updated_at = now;
    }
}

/// One persisted artifact produced while processing a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub task_id: String,
    pub url: String,
    pub item_type: ItemType,
    pub status: ItemStatus,
    pub title: Option<String>,
    pub content: Option<String>,
    pub file_path: Option<String>,
    /// Empty until content has been hashed
    pub content_hash: String,
    pub size: u64,
    pub error: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(task_id: impl Into<String>, url: impl Into<String>, item_type: ItemType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            url: url.into(),
            item_type,
            status: ItemStatus::Pending,
            title: None,
            content: None,
            file_path: None,
            content_hash: String::new(),
            size: 0,
            error: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records the size and digest of `bytes`
    pub fn hash_bytes(&mut self, bytes: &[u8]) {
        self.content_hash = hash_content(bytes);
        self.size = bytes.len() as u64;
    }
}

/// Aggregate progress computed from the task population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub running: u64,
    pub start_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Latest completion time once nothing is pending or running
    pub completed_at: Option<DateTime<Utc>>,
}

impl Progress {
    /// Builds progress from per-status counts and the task time bounds
    pub fn from_counts(
        counts: &BTreeMap<TaskStatus, u64>,
        first_created: Option<DateTime<Utc>>,
        last_completed: Option<DateTime<Utc>>,
    ) -> Self {
        let count = |status| counts.get(&status).copied().unwrap_or(0);
        let now = Utc::now();
        let total = counts.values().sum();
        let pending = count(TaskStatus::Pending);
        let running = count(TaskStatus::Running);

        Self {
            total,
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            pending,
            running,
            start_time: first_created.unwrap_or(now),
            updated_at: now,
            completed_at: if total > 0 && pending == 0 && running == 0 {
                last_completed
            } else {
                None
            },
        }
    }
}

/// Sortable task columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrder {
    CreatedAt,
    UpdatedAt,
    Priority,
    Depth,
    Url,
    Status,
    Retries,
}

impl TaskOrder {
    pub fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Priority => "priority",
            Self::Depth => "depth",
            Self::Url => "url",
            Self::Status => "status",
            Self::Retries => "retries",
        }
    }
}

/// Task query filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    /// Matches any of these statuses; empty matches all
    pub status: Vec<TaskStatus>,
    pub priority: Option<i32>,
    pub order_by: Option<TaskOrder>,
    pub descending: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TaskFilter {
    pub fn with_status(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        Self {
            status: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn order_by(mut self, order: TaskOrder, descending: bool) -> Self {
        self.order_by = Some(order);
        self.descending = descending;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.status.is_empty() || self.status.contains(&task.status))
            && self.priority.map_or(true, |p| task.priority == p)
    }
}

/// Sortable item columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrder {
    CreatedAt,
    UpdatedAt,
    Size,
    Url,
    Type,
    Status,
}

impl ItemOrder {
    pub fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Size => "size",
            Self::Url => "url",
            Self::Type => "type",
            Self::Status => "status",
        }
    }
}

/// Item query filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFilter {
    pub task_id: Option<String>,
    pub item_type: Vec<ItemType>,
    pub status: Vec<ItemStatus>,
    pub content_hash: Option<String>,
    pub order_by: Option<ItemOrder>,
    pub descending: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ItemFilter {
    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, item: &Item) -> bool {
        self.task_id.as_deref().map_or(true, |id| item.task_id == id)
            && (self.item_type.is_empty() || self.item_type.contains(&item.item_type))
            && (self.status.is_empty() || self.status.contains(&item.status))
            && self
                .content_hash
                .as_deref()
                .map_or(true, |hash| item.content_hash == hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_db_string(status.to_db_string()), Some(status));
        }
        assert_eq!(TaskStatus::from_db_string("invalid"), None);
    }

    #[test]
    fn test_new_task_hashes_url() {
        let task = Task::new("http://x/1");
        assert_eq!(task.url_hash, hash_url("http://x/1"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.method, "GET");
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_completed_at_follows_terminal_states() {
        let mut task = Task::new("http://x/1");

        task.set_status(TaskStatus::Running);
        assert!(task.completed_at.is_none());

        task.set_status(TaskStatus::Failed);
        assert!(task.completed_at.is_some());

        task.set_status(TaskStatus::Pending);
        assert!(task.completed_at.is_none());

        task.set_status(TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_blocking_statuses() {
        let blocking: Vec<_> = TaskStatus::ALL
            .into_iter()
            .filter(TaskStatus::blocks_resubmission)
            .collect();
        assert_eq!(blocking, vec![TaskStatus::Running, TaskStatus::Completed]);
    }

    #[test]
    fn test_item_type_from_content_type() {
        assert_eq!(ItemType::from_content_type("text/html; charset=utf-8"), ItemType::Html);
        assert_eq!(ItemType::from_content_type("image/png"), ItemType::Image);
        assert_eq!(ItemType::from_content_type("application/json"), ItemType::Data);
        assert_eq!(ItemType::from_content_type("application/pdf"), ItemType::File);
    }

    #[test]
    fn test_progress_from_counts() {
        let mut counts = BTreeMap::new();
        counts.insert(TaskStatus::Completed, 3);
        counts.insert(TaskStatus::Failed, 1);
        counts.insert(TaskStatus::Skipped, 1);

        let progress = Progress::from_counts(&counts, None, Some(Utc::now()));
        assert_eq!(progress.total, 5);
        assert_eq!(progress.completed, 3);
        assert_eq!(progress.failed, 1);
        assert!(progress.completed_at.is_some());

        counts.insert(TaskStatus::Running, 1);
        let progress = Progress::from_counts(&counts, None, Some(Utc::now()));
        assert!(progress.completed_at.is_none());
    }
}
