//! Duplicate detection
//!
//! Two independent dimensions are checked:
//! - task level, before a URL is fetched, keyed by URL or URL digest
//! - item level, after content is fetched, keyed by the content digest

use crate::storage::models::{Item, ItemStatus, Task};
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::ConfigError;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Key used for task-level duplicate detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum DuplicateStrategy {
    /// Exact match on the URL string
    Url,
    /// Match on the URL digest
    UrlHash,
    /// Content-level dedup only; never skips before a fetch
    ContentHash,
    /// Every submission proceeds
    None,
}

impl DuplicateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::UrlHash => "url_hash",
            Self::ContentHash => "content_hash",
            Self::None => "none",
        }
    }
}

impl fmt::Display for DuplicateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicateStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "url" => Ok(Self::Url),
            "url_hash" => Ok(Self::UrlHash),
            "content_hash" => Ok(Self::ContentHash),
            "none" => Ok(Self::None),
            other => Err(ConfigError::UnsupportedStrategy(other.to_string())),
        }
    }
}

impl TryFrom<String> for DuplicateStrategy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Outcome of a task-level duplicate check
#[derive(Debug, Clone, PartialEq)]
pub enum TaskDedup {
    /// Submission may proceed; carries the non-blocking prior task, if any
    Proceed(Option<Task>),
    /// A completed or running task already covers this key
    Skip(Task),
}

impl TaskDedup {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }
}

/// Computes the URL digest used for indexed lookups (MD5, hex)
pub fn hash_url(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

/// Computes the content digest used for item dedup (SHA-256, hex)
pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Decides whether a submission of `url` should be skipped
///
/// A prior task blocks only while it is running or once it has completed.
/// A missing prior task is not an error; any other storage failure is returned.
pub fn should_skip_task(
    storage: &dyn Storage,
    url: &str,
    strategy: DuplicateStrategy,
) -> StorageResult<TaskDedup> {
    let prior = match strategy {
        DuplicateStrategy::Url => not_found_as_none(storage.get_task_by_url(url))?,
        DuplicateStrategy::UrlHash => {
            not_found_as_none(storage.get_task_by_url_hash(&hash_url(url)))?
        }
        DuplicateStrategy::ContentHash | DuplicateStrategy::None => None,
    };

    Ok(match prior {
        Some(task) if task.status.blocks_resubmission() => TaskDedup::Skip(task),
        other => TaskDedup::Proceed(other),
    })
}

/// Decides whether content with `content_hash` was already saved
///
/// Returns the saved item when the content is a duplicate. An empty hash never matches.
pub fn should_skip_item(storage: &dyn Storage, content_hash: &str) -> StorageResult<Option<Item>> {
    if content_hash.is_empty() {
        return Ok(None);
    }

    let existing = not_found_as_none(storage.get_item_by_content_hash(content_hash))?;
    Ok(existing.filter(|item| item.status == ItemStatus::Saved))
}

fn not_found_as_none<T>(result: StorageResult<T>) -> StorageResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StorageError::TaskNotFound(_)) | Err(StorageError::ItemNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
