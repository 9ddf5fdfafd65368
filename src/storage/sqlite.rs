//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::storage::dedup::hash_url;
use crate::storage::models::{
    Item, ItemFilter, ItemStatus, ItemType, Progress, Task, TaskFilter, TaskStatus,
};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

const TASK_COLUMNS: &str = "id, url, url_hash, method, priority, depth, status, retries, \
     max_retries, error, metadata, created_at, updated_at, completed_at";

const ITEM_COLUMNS: &str = "id, task_id, url, type, status, title, content, file_path, \
     content_hash, size, error, metadata, created_at, updated_at";

/// SQLite storage backend
///
/// The connection sits behind a mutex so one backend can be shared across the
/// fetch callbacks. Closing drops the connection.
pub struct SqliteStorage {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStorage {
    /// Opens or creates the database at `path`, creating parent directories
    pub fn new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut guard = self.conn.lock().map_err(|_| StorageError::Lock)?;
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        f(conn)
    }
}

// ===== Row conversion =====

/// Drops sub-microsecond precision so values survive the text round trip
fn normalize(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn parse_metadata(row: &Row<'_>, idx: usize) -> rusqlite::Result<BTreeMap<String, serde_json::Value>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        url: row.get(1)?,
        url_hash: row.get(2)?,
        method: row.get(3)?,
        priority: row.get(4)?,
        depth: row.get(5)?,
        status: TaskStatus::from_db_string(&row.get::<_, String>(6)?)
            .unwrap_or(TaskStatus::Pending),
        retries: row.get(7)?,
        max_retries: row.get(8)?,
        error: row.get(9)?,
        metadata: parse_metadata(row, 10)?,
        created_at: parse_ts(row, 11)?,
        updated_at: parse_ts(row, 12)?,
        completed_at: parse_opt_ts(row, 13)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        task_id: row.get(1)?,
        url: row.get(2)?,
        item_type: ItemType::from_db_string(&row.get::<_, String>(3)?).unwrap_or(ItemType::File),
        status: ItemStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(ItemStatus::Pending),
        title: row.get(5)?,
        content: row.get(6)?,
        file_path: row.get(7)?,
        content_hash: row.get(8)?,
        size: row.get::<_, i64>(9)?.max(0) as u64,
        error: row.get(10)?,
        metadata: parse_metadata(row, 11)?,
        created_at: parse_ts(row, 12)?,
        updated_at: parse_ts(row, 13)?,
    })
}

fn prepare_new_task(task: &mut Task) {
    if task.id.is_empty() {
        task.id = uuid::Uuid::new_v4().to_string();
    }
    if task.url_hash.is_empty() {
        task.url_hash = hash_url(&task.url);
    }
    task.created_at = normalize(task.created_at);
    task.updated_at = normalize(task.updated_at);
    task.completed_at = task.completed_at.map(normalize);
}

fn insert_task(conn: &Connection, task: &Task) -> StorageResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            TASK_COLUMNS
        ),
        params![
            task.id,
            task.url,
            task.url_hash,
            task.method,
            task.priority,
            task.depth,
            task.status.to_db_string(),
            task.retries,
            task.max_retries,
            task.error,
            serde_json::to_string(&task.metadata)?,
            format_ts(&task.created_at),
            format_ts(&task.updated_at),
            task.completed_at.as_ref().map(format_ts),
        ],
    )?;
    Ok(())
}

fn write_task(conn: &Connection, task: &Task) -> StorageResult<()> {
    let changed = conn.execute(
        "UPDATE tasks SET url = ?2, url_hash = ?3, method = ?4, priority = ?5, depth = ?6,
         status = ?7, retries = ?8, max_retries = ?9, error = ?10, metadata = ?11,
         updated_at = ?12, completed_at = ?13
         WHERE id = ?1",
        params![
            task.id,
            task.url,
            task.url_hash,
            task.method,
            task.priority,
            task.depth,
            task.status.to_db_string(),
            task.retries,
            task.max_retries,
            task.error,
            serde_json::to_string(&task.metadata)?,
            format_ts(&task.updated_at),
            task.completed_at.as_ref().map(format_ts),
        ],
    )?;

    if changed == 0 {
        return Err(StorageError::TaskNotFound(task.id.clone()));
    }
    Ok(())
}

fn select_task(conn: &Connection, column: &str, value: &str) -> StorageResult<Option<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE {} = ?1 ORDER BY created_at ASC, rowid ASC LIMIT 1",
        TASK_COLUMNS, column
    );
    Ok(conn.query_row(&sql, [value], task_from_row).optional()?)
}

fn select_item(conn: &Connection, column: &str, value: &str) -> StorageResult<Option<Item>> {
    let sql = format!(
        "SELECT {} FROM items WHERE {} = ?1 ORDER BY created_at ASC, rowid ASC LIMIT 1",
        ITEM_COLUMNS, column
    );
    Ok(conn.query_row(&sql, [value], item_from_row).optional()?)
}

// ===== Filter translation =====

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn task_where(filter: &TaskFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if !filter.status.is_empty() {
        clauses.push(format!("status IN ({})", placeholders(filter.status.len())));
        args.extend(
            filter
                .status
                .iter()
                .map(|s| Value::Text(s.to_db_string().to_string())),
        );
    }

    if let Some(priority) = filter.priority {
        clauses.push("priority = ?".to_string());
        args.push(Value::Integer(priority as i64));
    }

    (where_sql(&clauses), args)
}

fn item_where(filter: &ItemFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if let Some(task_id) = &filter.task_id {
        clauses.push("task_id = ?".to_string());
        args.push(Value::Text(task_id.clone()));
    }

    if !filter.item_type.is_empty() {
        clauses.push(format!("type IN ({})", placeholders(filter.item_type.len())));
        args.extend(
            filter
                .item_type
                .iter()
                .map(|t| Value::Text(t.to_db_string().to_string())),
        );
    }

    if !filter.status.is_empty() {
        clauses.push(format!("status IN ({})", placeholders(filter.status.len())));
        args.extend(
            filter
                .status
                .iter()
                .map(|s| Value::Text(s.to_db_string().to_string())),
        );
    }

    if let Some(hash) = &filter.content_hash {
        clauses.push("content_hash = ?".to_string());
        args.push(Value::Text(hash.clone()));
    }

    (where_sql(&clauses), args)
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn order_and_page(
    column: Option<&'static str>,
    descending: bool,
    limit: Option<usize>,
    offset: usize,
) -> String {
    let mut sql = match column {
        Some(column) => format!(
            " ORDER BY {} {}, rowid ASC",
            column,
            if descending { "DESC" } else { "ASC" }
        ),
        None => " ORDER BY created_at ASC, rowid ASC".to_string(),
    };

    match (limit, offset) {
        (Some(limit), offset) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
        // SQLite requires a LIMIT before OFFSET
        (None, offset) if offset > 0 => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
        _ => {}
    }

    sql
}

impl Storage for SqliteStorage {
    // ===== Task Management =====

    fn save_task(&self, task: &mut Task) -> StorageResult<()> {
        prepare_new_task(task);
        self.with_conn(|conn| insert_task(conn, task))
    }

    fn get_task(&self, id: &str) -> StorageResult<Task> {
        self.with_conn(|conn| select_task(conn, "id", id))?
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))
    }

    fn get_task_by_url(&self, url: &str) -> StorageResult<Task> {
        self.with_conn(|conn| select_task(conn, "url", url))?
            .ok_or_else(|| StorageError::TaskNotFound(url.to_string()))
    }

    fn get_task_by_url_hash(&self, url_hash: &str) -> StorageResult<Task> {
        self.with_conn(|conn| select_task(conn, "url_hash", url_hash))?
            .ok_or_else(|| StorageError::TaskNotFound(url_hash.to_string()))
    }

    fn update_task(&self, task: &mut Task) -> StorageResult<()> {
        task.updated_at = normalize(Utc::now());
        task.completed_at = task.completed_at.map(normalize);
        self.with_conn(|conn| write_task(conn, task))
    }

    fn update_task_status(&self, id: &str, status: TaskStatus) -> StorageResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut task = select_task(&tx, "id", id)?
                .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;
            task.set_status(status);
            task.updated_at = normalize(task.updated_at);
            task.completed_at = task.completed_at.map(normalize);
            write_task(&tx, &task)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn delete_task(&self, id: &str) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    fn list_tasks(&self, filter: &TaskFilter) -> StorageResult<Vec<Task>> {
        let (where_clause, args) = task_where(filter);
        let sql = format!(
            "SELECT {} FROM tasks{}{}",
            TASK_COLUMNS,
            where_clause,
            order_and_page(
                filter.order_by.map(|o| o.column()),
                filter.descending,
                filter.limit,
                filter.offset
            )
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params_from_iter(args), task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    fn count_tasks(&self, filter: &TaskFilter) -> StorageResult<u64> {
        let (where_clause, args) = task_where(filter);
        let sql = format!("SELECT COUNT(*) FROM tasks{}", where_clause);

        self.with_conn(|conn| {
            let count: i64 = conn.query_row(&sql, params_from_iter(args), |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    fn save_tasks(&self, tasks: &mut [Task]) -> StorageResult<()> {
        tasks.iter_mut().for_each(prepare_new_task);

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for task in tasks.iter() {
                insert_task(&tx, task)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    // ===== Item Management =====

    fn save_item(&self, item: &mut Item) -> StorageResult<()> {
        if item.id.is_empty() {
            item.id = uuid::Uuid::new_v4().to_string();
        }
        item.created_at = normalize(item.created_at);
        item.updated_at = normalize(item.updated_at);

        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO items ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    ITEM_COLUMNS
                ),
                params![
                    item.id,
                    item.task_id,
                    item.url,
                    item.item_type.to_db_string(),
                    item.status.to_db_string(),
                    item.title,
                    item.content,
                    item.file_path,
                    item.content_hash,
                    item.size as i64,
                    item.error,
                    serde_json::to_string(&item.metadata)?,
                    format_ts(&item.created_at),
                    format_ts(&item.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get_item(&self, id: &str) -> StorageResult<Item> {
        self.with_conn(|conn| select_item(conn, "id", id))?
            .ok_or_else(|| StorageError::ItemNotFound(id.to_string()))
    }

    fn get_item_by_content_hash(&self, content_hash: &str) -> StorageResult<Item> {
        self.with_conn(|conn| select_item(conn, "content_hash", content_hash))?
            .ok_or_else(|| StorageError::ItemNotFound(content_hash.to_string()))
    }

    fn update_item_status(&self, id: &str, status: ItemStatus) -> StorageResult<()> {
        let now = format_ts(&Utc::now());
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE items SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.to_db_string(), now, id],
            )?;
            if changed == 0 {
                return Err(StorageError::ItemNotFound(id.to_string()));
            }
            Ok(())
        })
    }

    fn list_items(&self, filter: &ItemFilter) -> StorageResult<Vec<Item>> {
        let (where_clause, args) = item_where(filter);
        let sql = format!(
            "SELECT {} FROM items{}{}",
            ITEM_COLUMNS,
            where_clause,
            order_and_page(
                filter.order_by.map(|o| o.column()),
                filter.descending,
                filter.limit,
                filter.offset
            )
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(params_from_iter(args), item_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(items)
        })
    }

    fn count_items(&self, filter: &ItemFilter) -> StorageResult<u64> {
        let (where_clause, args) = item_where(filter);
        let sql = format!("SELECT COUNT(*) FROM items{}", where_clause);

        self.with_conn(|conn| {
            let count: i64 = conn.query_row(&sql, params_from_iter(args), |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    fn delete_item(&self, id: &str) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM items WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    // ===== Maintenance =====

    fn progress(&self) -> StorageResult<Progress> {
        self.with_conn(|conn| {
            let mut counts = BTreeMap::new();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                if let Some(status) = TaskStatus::from_db_string(&status) {
                    counts.insert(status, count as u64);
                }
            }

            let (first_created, last_completed) = conn.query_row(
                "SELECT MIN(created_at), MAX(completed_at) FROM tasks",
                [],
                |row| Ok((parse_opt_ts(row, 0)?, parse_opt_ts(row, 1)?)),
            )?;

            Ok(Progress::from_counts(&counts, first_created, last_completed))
        })
    }

    fn clear(&self) -> StorageResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM items", [])?;
            tx.execute("DELETE FROM tasks", [])?;
            tx.commit()?;
            Ok(())
        })
    }

    fn close(&self) -> StorageResult<()> {
        let mut guard = self.conn.lock().map_err(|_| StorageError::Lock)?;
        match guard.take() {
            Some(conn) => conn.close().map_err(|(_, e)| StorageError::Sqlite(e)),
            None => Ok(()),
        }
    }
}
