//! Crawl Conductor: crawl task orchestration
//!
//! This crate schedules, deduplicates, retries and tracks web-fetch tasks on top
//! of a concurrent fetch engine. Tasks and the items they produce are persisted
//! through a pluggable [`storage::Storage`] backend.

pub mod client;
pub mod config;
pub mod engine;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod storage;

use thiserror::Error;

/// Main error type for crawl orchestration
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("Fetch engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("Crawler has been stopped")]
    Stopped,

    #[error("Queue is not enabled")]
    QueueDisabled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported storage type: {0}")]
    UnsupportedStorage(String),

    #[error("Unsupported duplicate strategy: {0}")]
    UnsupportedStrategy(String),
}

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use client::{Client, LifecycleState};
pub use config::Config;
pub use queue::{Queue, Request, RequestContext};
pub use storage::{DuplicateStrategy, Item, Progress, Storage, Task, TaskStatus};
