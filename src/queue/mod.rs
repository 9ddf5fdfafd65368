//! Priority request queue
//!
//! Holds requests waiting for dispatch, ordered by `(priority, timestamp)` with
//! lower values first. The queue can be saved to and restored from a JSON
//! snapshot so a stopped crawl can pick up where it left off.

mod request;

pub use request::{HeaderMap, Request, RequestContext};

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors from queue snapshot operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue snapshot not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Queue snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue snapshot is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Thread-safe priority queue of pending requests
#[derive(Debug)]
pub struct Queue {
    requests: Mutex<Vec<Request>>,
    enabled: AtomicBool,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    /// Creates an empty, enabled queue
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Request>> {
        // A panic mid-sort leaves a valid Vec; keep serving it
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Adds a request, filling in the method and timestamp if absent
    pub fn add(&self, mut request: Request) {
        request.apply_defaults(Utc::now());

        let mut requests = self.lock();
        requests.push(request);
        sort_requests(&mut requests);
    }

    /// Adds several requests under one lock
    pub fn add_batch(&self, batch: impl IntoIterator<Item = Request>) {
        let now = Utc::now();
        let mut requests = self.lock();
        for mut request in batch {
            request.apply_defaults(now);
            requests.push(request);
        }
        sort_requests(&mut requests);
    }

    /// Removes and returns the most urgent request without blocking
    pub fn pop(&self) -> Option<Request> {
        let mut requests = self.lock();
        if requests.is_empty() {
            None
        } else {
            Some(requests.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        let mut requests = self.lock();
        let dropped = requests.len();
        requests.clear();
        tracing::info!(dropped, "Queue cleared");
    }

    /// Writes the pending requests to `path` as a pretty-printed JSON array
    pub fn save_to_file(&self, path: &Path) -> Result<usize, QueueError> {
        let (json, count) = {
            let requests = self.lock();
            (serde_json::to_string_pretty(&*requests)?, requests.len())
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;

        tracing::info!(count, path = %path.display(), "Queue saved");
        Ok(count)
    }

    /// Appends the requests stored at `path` to the live queue
    ///
    /// The whole document is decoded before anything is added, so a malformed
    /// snapshot leaves the queue untouched.
    pub fn load_from_file(&self, path: &Path) -> Result<usize, QueueError> {
        if !path.exists() {
            return Err(QueueError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let batch: Vec<Request> = serde_json::from_str(&content)?;
        let count = batch.len();
        self.add_batch(batch);

        tracing::info!(count, path = %path.display(), "Queue loaded");
        Ok(count)
    }
}

fn sort_requests(requests: &mut [Request]) {
    // Stable, so equal keys keep insertion order
    requests.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
}
