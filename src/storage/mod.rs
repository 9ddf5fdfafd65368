//! Storage module for persisting crawl tasks
//!
//! This module handles all persistence for the orchestrator, including:
//! - the [`Storage`] contract shared by every backend
//! - SQLite, MySQL and in-memory backends
//! - task and item records with their query filters
//! - the duplicate-detection policy

mod dedup;
mod memory;
mod models;
mod mysql;
mod schema;
mod sqlite;
mod traits;

pub use dedup::{
    hash_content, hash_url, should_skip_item, should_skip_task, DuplicateStrategy, TaskDedup,
};
pub use memory::MemoryStorage;
pub use models::{
    Item, ItemFilter, ItemOrder, ItemStatus, ItemType, Metadata, Progress, Task, TaskFilter,
    TaskOrder, TaskStatus,
};
pub use mysql::MySqlStorage;
pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::config::StorageConfig;
use crate::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Available storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum StorageType {
    Sqlite,
    MySql,
    Memory,
}

impl FromStr for StorageType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "mysql" => Ok(Self::MySql),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::UnsupportedStorage(other.to_string())),
        }
    }
}

impl TryFrom<String> for StorageType {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => f.write_str("sqlite"),
            Self::MySql => f.write_str("mysql"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// Opens the backend named by the configuration
///
/// # Arguments
///
/// * `config` - Storage section of the configuration
///
/// # Returns
///
/// * `Ok(Arc<dyn Storage>)` - Backend ready for use
/// * `Err(StorageError)` - The database could not be opened
pub fn open_storage(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match config.storage_type {
        StorageType::Sqlite => {
            let path = config.database_path();
            tracing::debug!(path = %path.display(), "Opening SQLite storage");
            Ok(Arc::new(SqliteStorage::new(&path)?))
        }
        StorageType::MySql => {
            let dsn = config.dsn.as_deref().unwrap_or_default();
            Ok(Arc::new(MySqlStorage::connect(dsn)?))
        }
        StorageType::Memory => Ok(Arc::new(MemoryStorage::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_storage_type_parse() {
        assert_eq!("sqlite".parse::<StorageType>().unwrap(), StorageType::Sqlite);
        assert_eq!("memory".parse::<StorageType>().unwrap(), StorageType::Memory);
        assert_eq!("mysql".parse::<StorageType>().unwrap(), StorageType::MySql);
        assert_eq!(StorageType::MySql.to_string(), "mysql");

        let err = "postgres".parse::<StorageType>().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedStorage(_)));
        assert!(err.to_string().contains("postgres"));
    }

    #[test]
    fn test_open_storage_mysql_rejects_bad_dsn() {
        let config = StorageConfig {
            enabled: true,
            storage_type: StorageType::MySql,
            dsn: Some("not a dsn".to_string()),
            ..StorageConfig::default()
        };

        assert!(open_storage(&config).is_err());
    }

    #[test]
    fn test_open_storage_sqlite_in_dir() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            enabled: true,
            dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };

        let storage = open_storage(&config).unwrap();
        storage.save_task(&mut Task::new("http://x/1")).unwrap();
        assert!(dir.path().join("crawler.db").exists());
        storage.close().unwrap();
    }

    #[test]
    fn test_open_storage_memory() {
        let config = StorageConfig {
            enabled: true,
            storage_type: StorageType::Memory,
            ..StorageConfig::default()
        };

        let storage = open_storage(&config).unwrap();
        assert_eq!(storage.progress().unwrap().total, 0);
    }
}
