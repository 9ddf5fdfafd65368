//! In-process storage backend
//!
//! Keeps tasks and items in hash maps. Insertion order is tracked so lookups by
//! URL or content digest agree with the SQLite backend on which match is returned.

use crate::storage::dedup::hash_url;
use crate::storage::models::{
    Item, ItemFilter, ItemOrder, ItemStatus, Progress, Task, TaskFilter, TaskOrder, TaskStatus,
};
use crate::storage::traits::{Storage, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Tables {
    closed: bool,
    next_seq: u64,
    tasks: HashMap<String, (u64, Task)>,
    items: HashMap<String, (u64, Item)>,
}

impl Tables {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Storage backend held entirely in memory
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, Tables>> {
        let guard = self.tables.read().map_err(|_| StorageError::Lock)?;
        if guard.closed {
            return Err(StorageError::Closed);
        }
        Ok(guard)
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, Tables>> {
        let guard = self.tables.write().map_err(|_| StorageError::Lock)?;
        if guard.closed {
            return Err(StorageError::Closed);
        }
        Ok(guard)
    }
}

fn compare_tasks(order: Option<TaskOrder>, a: &Task, b: &Task) -> Ordering {
    match order {
        Some(TaskOrder::CreatedAt) | None => a.created_at.cmp(&b.created_at),
        Some(TaskOrder::UpdatedAt) => a.updated_at.cmp(&b.updated_at),
        Some(TaskOrder::Priority) => a.priority.cmp(&b.priority),
        Some(TaskOrder::Depth) => a.depth.cmp(&b.depth),
        Some(TaskOrder::Url) => a.url.cmp(&b.url),
        Some(TaskOrder::Status) => a.status.to_db_string().cmp(b.status.to_db_string()),
        Some(TaskOrder::Retries) => a.retries.cmp(&b.retries),
    }
}

fn compare_items(order: Option<ItemOrder>, a: &Item, b: &Item) -> Ordering {
    match order {
        Some(ItemOrder::CreatedAt) | None => a.created_at.cmp(&b.created_at),
        Some(ItemOrder::UpdatedAt) => a.updated_at.cmp(&b.updated_at),
        Some(ItemOrder::Size) => a.size.cmp(&b.size),
        Some(ItemOrder::Url) => a.url.cmp(&b.url),
        Some(ItemOrder::Type) => a.item_type.to_db_string().cmp(b.item_type.to_db_string()),
        Some(ItemOrder::Status) => a.status.to_db_string().cmp(b.status.to_db_string()),
    }
}

/// Sorts by the requested column, then by insertion order, and applies paging
///
/// `descending` flips only the requested column; ties keep insertion order.
fn page<T: Clone>(
    mut rows: Vec<&(u64, T)>,
    cmp: impl Fn(&T, &T) -> Ordering,
    descending: bool,
    offset: usize,
    limit: Option<usize>,
) -> Vec<T> {
    rows.sort_by(|(sa, a), (sb, b)| {
        let primary = cmp(a, b);
        let primary = if descending { primary.reverse() } else { primary };
        primary.then(sa.cmp(sb))
    });

    rows.into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .map(|(_, row)| row.clone())
        .collect()
}

/// Earliest-created row, insertion order breaking ties
fn earliest<'a, T: 'a>(
    rows: impl Iterator<Item = &'a (u64, T)>,
    created_at: impl Fn(&T) -> DateTime<Utc>,
) -> Option<&'a T> {
    rows.min_by(|(sa, a), (sb, b)| created_at(a).cmp(&created_at(b)).then(sa.cmp(sb)))
        .map(|(_, row)| row)
}

impl Storage for MemoryStorage {
    fn save_task(&self, task: &mut Task) -> StorageResult<()> {
        let mut tables = self.write()?;
        if task.id.is_empty() {
            task.id = uuid::Uuid::new_v4().to_string();
        }
        if task.url_hash.is_empty() {
            task.url_hash = hash_url(&task.url);
        }
        if tables.tasks.contains_key(&task.id) {
            return Err(StorageError::ConstraintViolation(format!(
                "duplicate task id {}",
                task.id
            )));
        }
        let seq = tables.seq();
        tables.tasks.insert(task.id.clone(), (seq, task.clone()));
        Ok(())
    }

    fn get_task(&self, id: &str) -> StorageResult<Task> {
        self.read()?
            .tasks
            .get(id)
            .map(|(_, task)| task.clone())
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))
    }

    fn get_task_by_url(&self, url: &str) -> StorageResult<Task> {
        let tables = self.read()?;
        earliest(tables.tasks.values().filter(|(_, t)| t.url == url), |t| t.created_at)
            .cloned()
            .ok_or_else(|| StorageError::TaskNotFound(url.to_string()))
    }

    fn get_task_by_url_hash(&self, url_hash: &str) -> StorageResult<Task> {
        let tables = self.read()?;
        earliest(
            tables.tasks.values().filter(|(_, t)| t.url_hash == url_hash),
            |t| t.created_at,
        )
        .cloned()
        .ok_or_else(|| StorageError::TaskNotFound(url_hash.to_string()))
    }

    fn update_task(&self, task: &mut Task) -> StorageResult<()> {
        let mut tables = self.write()?;
        let (_, stored) = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StorageError::TaskNotFound(task.id.clone()))?;
        task.updated_at = Utc::now();
        // created_at is immutable once stored
        task.created_at = stored.created_at;
        *stored = task.clone();
        Ok(())
    }

    fn update_task_status(&self, id: &str, status: TaskStatus) -> StorageResult<()> {
        let mut tables = self.write()?;
        let (_, stored) = tables
            .tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;
        stored.set_status(status);
        Ok(())
    }

    fn delete_task(&self, id: &str) -> StorageResult<()> {
        self.write()?.tasks.remove(id);
        Ok(())
    }

    fn list_tasks(&self, filter: &TaskFilter) -> StorageResult<Vec<Task>> {
        let tables = self.read()?;
        let rows = tables
            .tasks
            .values()
            .filter(|(_, t)| filter.matches(t))
            .collect();
        let order = filter.order_by;
        Ok(page(
            rows,
            |a, b| compare_tasks(order, a, b),
            filter.descending,
            filter.offset,
            filter.limit,
        ))
    }

    fn count_tasks(&self, filter: &TaskFilter) -> StorageResult<u64> {
        let tables = self.read()?;
        Ok(tables.tasks.values().filter(|(_, t)| filter.matches(t)).count() as u64)
    }

    fn save_tasks(&self, tasks: &mut [Task]) -> StorageResult<()> {
        let mut tables = self.write()?;
        for task in tasks.iter_mut() {
            if task.id.is_empty() {
                task.id = uuid::Uuid::new_v4().to_string();
            }
            if task.url_hash.is_empty() {
                task.url_hash = hash_url(&task.url);
            }
        }

        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = tasks
            .iter()
            .find(|t| tables.tasks.contains_key(&t.id) || !seen.insert(t.id.as_str()))
        {
            return Err(StorageError::ConstraintViolation(format!(
                "duplicate task id {}",
                dup.id
            )));
        }

        for task in tasks.iter() {
            let seq = tables.seq();
            tables.tasks.insert(task.id.clone(), (seq, task.clone()));
        }
        Ok(())
    }

    fn save_item(&self, item: &mut Item) -> StorageResult<()> {
        let mut tables = self.write()?;
        if item.id.is_empty() {
            item.id = uuid::Uuid::new_v4().to_string();
        }
        let seq = tables.seq();
        tables.items.insert(item.id.clone(), (seq, item.clone()));
        Ok(())
    }

    fn get_item(&self, id: &str) -> StorageResult<Item> {
        self.read()?
            .items
            .get(id)
            .map(|(_, item)| item.clone())
            .ok_or_else(|| StorageError::ItemNotFound(id.to_string()))
    }

    fn get_item_by_content_hash(&self, content_hash: &str) -> StorageResult<Item> {
        let tables = self.read()?;
        earliest(
            tables
                .items
                .values()
                .filter(|(_, i)| i.content_hash == content_hash),
            |i| i.created_at,
        )
        .cloned()
        .ok_or_else(|| StorageError::ItemNotFound(content_hash.to_string()))
    }

    fn update_item_status(&self, id: &str, status: ItemStatus) -> StorageResult<()> {
        let mut tables = self.write()?;
        let (_, stored) = tables
            .items
            .get_mut(id)
            .ok_or_else(|| StorageError::ItemNotFound(id.to_string()))?;
        stored.status = status;
        stored.updated_at = Utc::now();
        Ok(())
    }

    fn list_items(&self, filter: &ItemFilter) -> StorageResult<Vec<Item>> {
        let tables = self.read()?;
        let rows = tables
            .items
            .values()
            .filter(|(_, i)| filter.matches(i))
            .collect();
        let order = filter.order_by;
        Ok(page(
            rows,
            |a, b| compare_items(order, a, b),
            filter.descending,
            filter.offset,
            filter.limit,
        ))
    }

    fn count_items(&self, filter: &ItemFilter) -> StorageResult<u64> {
        let tables = self.read()?;
        Ok(tables.items.values().filter(|(_, i)| filter.matches(i)).count() as u64)
    }

    fn delete_item(&self, id: &str) -> StorageResult<()> {
        self.write()?.items.remove(id);
        Ok(())
    }

    fn progress(&self) -> StorageResult<Progress> {
        let tables = self.read()?;
        let mut counts = BTreeMap::new();
        for (_, task) in tables.tasks.values() {
            *counts.entry(task.status).or_insert(0u64) += 1;
        }
        let first_created = tables.tasks.values().map(|(_, t)| t.created_at).min();
        let last_completed = tables
            .tasks
            .values()
            .filter_map(|(_, t)| t.completed_at)
            .max();
        Ok(Progress::from_counts(&counts, first_created, last_completed))
    }

    fn clear(&self) -> StorageResult<()> {
        let mut tables = self.write()?;
        tables.items.clear();
        tables.tasks.clear();
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        let mut tables = self.tables.write().map_err(|_| StorageError::Lock)?;
        tables.closed = true;
        tables.tasks.clear();
        tables.items.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ItemType;

    #[test]
    fn test_task_lifecycle() {
        let storage = MemoryStorage::new();
        let mut task = Task::new("http://x/1");
        storage.save_task(&mut task).unwrap();

        storage
            .update_task_status(&task.id, TaskStatus::Running)
            .unwrap();
        let mut loaded = storage.get_task(&task.id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);

        loaded.retries = 2;
        loaded.error = Some("503".to_string());
        storage.update_task(&mut loaded).unwrap();
        assert_eq!(storage.get_task(&task.id).unwrap().retries, 2);

        storage.delete_task(&task.id).unwrap();
        assert!(storage.get_task(&task.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_ordering_and_paging() {
        let storage = MemoryStorage::new();
        let mut tasks: Vec<Task> = [3, 1, 2, 1]
            .into_iter()
            .enumerate()
            .map(|(i, p)| Task::new(format!("http://x/{}", i)).with_priority(p))
            .collect();
        storage.save_tasks(&mut tasks).unwrap();

        let filter = TaskFilter::default().order_by(TaskOrder::Priority, false);
        let urls: Vec<String> = storage
            .list_tasks(&filter)
            .unwrap()
            .into_iter()
            .map(|t| t.url)
            .collect();
        assert_eq!(urls, vec!["http://x/1", "http://x/3", "http://x/2", "http://x/0"]);

        let filter = TaskFilter::default()
            .order_by(TaskOrder::Priority, true)
            .page(0, 2);
        let priorities: Vec<i32> = storage
            .list_tasks(&filter)
            .unwrap()
            .into_iter()
            .map(|t| t.priority)
            .collect();
        assert_eq!(priorities, vec![3, 2]);
    }

    #[test]
    fn test_save_tasks_rejects_duplicates_atomically() {
        let storage = MemoryStorage::new();
        let task = Task::new("http://x/1");
        let mut batch = vec![task.clone(), Task::new("http://x/2"), task];
        assert!(storage.save_tasks(&mut batch).is_err());
        assert_eq!(storage.count_tasks(&TaskFilter::default()).unwrap(), 0);
    }

    #[test]
    fn test_item_filters() {
        let storage = MemoryStorage::new();
        let mut html = Item::new("t1", "http://x/1", ItemType::Html);
        let mut image = Item::new("t1", "http://x/logo.png", ItemType::Image);
        let mut other = Item::new("t2", "http://x/2", ItemType::Html);
        storage.save_item(&mut html).unwrap();
        storage.save_item(&mut image).unwrap();
        storage.save_item(&mut other).unwrap();

        assert_eq!(storage.count_items(&ItemFilter::for_task("t1")).unwrap(), 2);

        let filter = ItemFilter {
            item_type: vec![ItemType::Html],
            ..ItemFilter::default()
        };
        assert_eq!(storage.list_items(&filter).unwrap().len(), 2);
    }

    #[test]
    fn test_close() {
        let storage = MemoryStorage::new();
        storage.save_task(&mut Task::new("http://x/1")).unwrap();
        storage.close().unwrap();
        assert!(matches!(storage.progress(), Err(StorageError::Closed)));
    }
}
