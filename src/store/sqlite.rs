//! SQLite adapter for record and task storage
//!
//! One connection behind an async mutex, WAL journaling, and a
//! schema-version table for forward migrations.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::record::{PasteItem, PasteRecord, RecordId, RecordState};
use crate::tasks::{TaskKind, TaskRecord, TaskStatus};

use super::{PasteStore, RecordFlag, RecordQuery, StoreError, TaskStore};

const SCHEMA_VERSION: u32 = 1;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

struct RecordRow {
    id: i64,
    owner: String,
    origin_id: Option<i64>,
    created_at: i64,
    updated_at: i64,
    hash: String,
    size: i64,
    source_app: Option<String>,
    favorite: i64,
    state: String,
    remote: i64,
    items: String,
    tags: String,
}

struct TaskRow {
    id: i64,
    kind: String,
    record_id: Option<i64>,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    params: String,
    created_at: i64,
    updated_at: i64,
}

const RECORD_COLUMNS: &str = "id, owner, origin_id, created_at, updated_at, hash, size, \
     source_app, favorite, state, remote, items, tags";

const TASK_COLUMNS: &str =
    "id, kind, record_id, status, attempts, last_error, params, created_at, updated_at";

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests that want real SQL semantics.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        let table_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get(0),
        )?;

        let version = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get::<_, u32>(0),
            )
            .optional()?
            .unwrap_or(0)
        } else {
            0
        };

        if version == 0 {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at INTEGER DEFAULT (strftime('%s', 'now'))
                );

                CREATE TABLE IF NOT EXISTS records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner TEXT NOT NULL,
                    origin_id INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    hash TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    source_app TEXT,
                    favorite INTEGER NOT NULL DEFAULT 0,
                    state TEXT NOT NULL,
                    remote INTEGER NOT NULL DEFAULT 0,
                    items TEXT NOT NULL,
                    tags TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_records_state ON records(state);
                CREATE INDEX IF NOT EXISTS idx_records_hash_size ON records(hash, size);
                CREATE INDEX IF NOT EXISTS idx_records_origin ON records(owner, origin_id);

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    record_id INTEGER,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    params TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                ",
            )?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )?;
        }

        Ok(())
    }

    fn row_to_record(row: RecordRow) -> Result<PasteRecord, StoreError> {
        let owner = Uuid::parse_str(&row.owner)
            .map_err(|e| StoreError::Corrupt(format!("bad owner uuid: {e}")))?;
        let items: Vec<PasteItem> = serde_json::from_str(&row.items)?;
        let tags: Vec<String> = serde_json::from_str(&row.tags)?;
        let state = RecordState::parse(&row.state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown record state {}", row.state)))?;
        Ok(PasteRecord {
            id: row.id,
            owner,
            origin_id: row.origin_id,
            created_at: millis_to_datetime(row.created_at),
            updated_at: millis_to_datetime(row.updated_at),
            hash: row.hash,
            size: row.size as u64,
            source_app: row.source_app,
            favorite: row.favorite != 0,
            state,
            remote: row.remote != 0,
            items,
            tags,
        })
    }

    fn row_to_task(row: TaskRow) -> Result<TaskRecord, StoreError> {
        let kind = TaskKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown task kind {}", row.kind)))?;
        let status = TaskStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown task status {}", row.status)))?;
        Ok(TaskRecord {
            id: row.id,
            kind,
            record_id: row.record_id,
            status,
            attempts: row.attempts as u32,
            last_error: row.last_error,
            params: serde_json::from_str(&row.params)?,
            created_at: millis_to_datetime(row.created_at),
            updated_at: millis_to_datetime(row.updated_at),
        })
    }

    fn read_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
        Ok(RecordRow {
            id: row.get(0)?,
            owner: row.get(1)?,
            origin_id: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            hash: row.get(5)?,
            size: row.get(6)?,
            source_app: row.get(7)?,
            favorite: row.get(8)?,
            state: row.get(9)?,
            remote: row.get(10)?,
            items: row.get(11)?,
            tags: row.get(12)?,
        })
    }

    fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
        Ok(TaskRow {
            id: row.get(0)?,
            kind: row.get(1)?,
            record_id: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            params: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[async_trait]
impl PasteStore for SqliteStore {
    async fn create_placeholder(&self, record: &PasteRecord) -> Result<RecordId, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO records
             (owner, origin_id, created_at, updated_at, hash, size, source_app,
              favorite, state, remote, items, tags)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.owner.to_string(),
                record.origin_id,
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
                record.hash,
                record.size as i64,
                record.source_app,
                record.favorite as i64,
                RecordState::Loading.as_str(),
                record.remote as i64,
                serde_json::to_string(&record.items)?,
                serde_json::to_string(&record.tags)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn finalize(&self, id: RecordId, items: &[PasteItem]) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;

        let state: Option<String> = conn
            .query_row("SELECT state FROM records WHERE id = ?", params![id], |r| {
                r.get(0)
            })
            .optional()?;
        let state = state.ok_or(StoreError::NotFound(id))?;
        let from = RecordState::parse(&state).unwrap_or(RecordState::Deleted);
        if from != RecordState::Loading {
            return Err(StoreError::InvalidTransition {
                id,
                from,
                to: RecordState::Loaded,
            });
        }

        let mut summary = PasteRecord::placeholder(Uuid::nil(), None, false);
        summary.items = items.to_vec();
        summary.refresh_summary();

        conn.execute(
            "UPDATE records SET state = ?, items = ?, hash = ?, size = ?, updated_at = ?
             WHERE id = ?",
            params![
                RecordState::Loaded.as_str(),
                serde_json::to_string(items)?,
                summary.hash,
                summary.size as i64,
                Utc::now().timestamp_millis(),
                id,
            ],
        )?;
        Ok(())
    }

    async fn mark_deleted(&self, id: RecordId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE records SET state = ?, updated_at = ? WHERE id = ?",
            params![
                RecordState::Deleted.as_str(),
                Utc::now().timestamp_millis(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn purge(&self, id: RecordId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM records WHERE id = ? AND state = ?",
            params![id, RecordState::Deleted.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<PasteRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?"),
                params![id],
                Self::read_record_row,
            )
            .optional()?;
        row.map(Self::row_to_record).transpose()
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<PasteRecord>, StoreError> {
        let conn = self.conn.lock().await;

        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(states) = &query.states {
            let marks = vec!["?"; states.len()].join(", ");
            sql.push_str(&format!(" AND state IN ({marks})"));
            for state in states {
                args.push(Box::new(state.as_str().to_string()));
            }
        }
        if let Some(remote) = query.remote {
            sql.push_str(" AND remote = ?");
            args.push(Box::new(remote as i64));
        }
        if let Some(min_id) = query.min_id {
            sql.push_str(" AND id >= ?");
            args.push(Box::new(min_id));
        }
        if let Some(hash) = &query.hash {
            sql.push_str(" AND hash = ?");
            args.push(Box::new(hash.clone()));
        }
        if let Some(size) = query.size {
            sql.push_str(" AND size = ?");
            args.push(Box::new(size as i64));
        }
        if let Some((owner, origin_id)) = query.origin {
            sql.push_str(" AND owner = ? AND origin_id = ?");
            args.push(Box::new(owner.to_string()));
            args.push(Box::new(origin_id));
        }
        sql.push_str(if query.newest_first {
            " ORDER BY id DESC"
        } else {
            " ORDER BY id ASC"
        });
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            Self::read_record_row,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(Self::row_to_record(row?)?);
        }
        Ok(records)
    }

    async fn update_flag(
        &self,
        id: RecordId,
        flag: RecordFlag,
        value: bool,
    ) -> Result<(), StoreError> {
        let column = match flag {
            RecordFlag::Favorite => "favorite",
        };
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            &format!("UPDATE records SET {column} = ?, updated_at = ? WHERE id = ?"),
            params![value as i64, Utc::now().timestamp_millis(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn update_items(&self, id: RecordId, items: &[PasteItem]) -> Result<(), StoreError> {
        let mut summary = PasteRecord::placeholder(Uuid::nil(), None, false);
        summary.items = items.to_vec();
        summary.refresh_summary();

        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE records SET items = ?, hash = ?, size = ?, updated_at = ? WHERE id = ?",
            params![
                serde_json::to_string(items)?,
                summary.hash,
                summary.size as i64,
                Utc::now().timestamp_millis(),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn enqueue(
        &self,
        kind: TaskKind,
        record_id: Option<RecordId>,
        params: serde_json::Value,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO tasks (kind, record_id, status, attempts, params, created_at, updated_at)
             VALUES (?, ?, ?, 0, ?, ?, ?)",
            params![
                kind.as_str(),
                record_id,
                TaskStatus::Pending.as_str(),
                serde_json::to_string(&params)?,
                now,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn claim_pending(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY id ASC LIMIT ?"
        ))?;
        let rows = stmt.query_map(
            params![TaskStatus::Pending.as_str(), limit as i64],
            Self::read_task_row,
        )?;

        let mut claimed = Vec::new();
        for row in rows {
            let mut task = Self::row_to_task(row?)?;
            task.status = TaskStatus::Executing;
            claimed.push(task);
        }
        drop(stmt);

        let now = Utc::now().timestamp_millis();
        for task in &claimed {
            conn.execute(
                "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?",
                params![TaskStatus::Executing.as_str(), now, task.id],
            )?;
        }
        Ok(claimed)
    }

    async fn update_task(
        &self,
        id: i64,
        status: TaskStatus,
        attempts: u32,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = if let Some(err) = last_error {
            conn.execute(
                "UPDATE tasks SET status = ?, attempts = ?, last_error = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    status.as_str(),
                    attempts,
                    err,
                    Utc::now().timestamp_millis(),
                    id
                ],
            )?
        } else {
            conn.execute(
                "UPDATE tasks SET status = ?, attempts = ?, updated_at = ? WHERE id = ?",
                params![status.as_str(), attempts, Utc::now().timestamp_millis(), id],
            )?
        };
        if changed == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"),
                params![id],
                Self::read_task_row,
            )
            .optional()?;
        row.map(Self::row_to_task).transpose()
    }

    async fn recover_executing(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?, updated_at = ? WHERE status = ?",
            params![
                TaskStatus::Pending.as_str(),
                Utc::now().timestamp_millis(),
                TaskStatus::Executing.as_str(),
            ],
        )?;
        Ok(changed)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM tasks WHERE status IN (?, ?) AND updated_at < ?",
            params![
                TaskStatus::Success.as_str(),
                TaskStatus::Failure.as_str(),
                cutoff.timestamp_millis(),
            ],
        )?;
        Ok(changed)
    }

    async fn purge_orphaned(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM tasks WHERE record_id IS NOT NULL
             AND record_id NOT IN (SELECT id FROM records)",
            [],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Payload;
    use crate::store::RecordQuery;
    use pretty_assertions::assert_eq;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn placeholder() -> PasteRecord {
        PasteRecord::placeholder(Uuid::new_v4(), Some("TestApp".into()), false)
    }

    #[tokio::test]
    async fn round_trips_records() {
        let store = store();
        let id = store.create_placeholder(&placeholder()).await.unwrap();

        let items = vec![PasteItem::new(Payload::Text("hello".into()), vec![])];
        store.finalize(id, &items).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Loaded);
        assert_eq!(record.items, items);
        assert_eq!(record.source_app.as_deref(), Some("TestApp"));
        assert_eq!(record.size, 5);
    }

    #[tokio::test]
    async fn query_by_hash_and_size() {
        let store = store();
        let id = store.create_placeholder(&placeholder()).await.unwrap();
        let items = vec![PasteItem::new(Payload::Text("dup".into()), vec![])];
        store.finalize(id, &items).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();

        let hits = store
            .query(&RecordQuery {
                hash: Some(record.hash.clone()),
                size: Some(record.size),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);

        let misses = store
            .query(&RecordQuery {
                hash: Some("nope".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn task_queue_lifecycle() {
        let store = store();
        let id = store
            .enqueue(TaskKind::PullFile, None, serde_json::json!({"path": "x"}))
            .await
            .unwrap();

        let claimed = store.claim_pending(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, TaskStatus::Executing);

        // Nothing left to claim.
        assert!(store.claim_pending(10).await.unwrap().is_empty());

        store
            .update_task(id, TaskStatus::Success, 0, None)
            .await
            .unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn orphan_purge_drops_dangling_tasks() {
        let store = store();
        let record_id = store.create_placeholder(&placeholder()).await.unwrap();
        store
            .enqueue(TaskKind::RenderMarkup, Some(record_id), serde_json::json!({}))
            .await
            .unwrap();
        store
            .enqueue(TaskKind::RenderMarkup, Some(9999), serde_json::json!({}))
            .await
            .unwrap();

        let purged = store.purge_orphaned().await.unwrap();
        assert_eq!(purged, 1);
    }
}
