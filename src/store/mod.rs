//! Durable storage interfaces
//!
//! The pipeline consumes two narrow traits: [`PasteStore`] for record
//! CRUD/query and [`TaskStore`] for the durable task queue. The default
//! backend is the sqlite adapter; the in-memory implementation backs
//! unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::{DeviceId, PasteItem, PasteRecord, RecordId, RecordState};
use crate::tasks::{TaskKind, TaskRecord, TaskStatus};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("invalid state transition for record {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: RecordId,
        from: RecordState,
        to: RecordState,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mutable record flags. Content is immutable once Loaded; only flags
/// and deletion propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFlag {
    Favorite,
}

/// Record query filters. All present filters are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub states: Option<Vec<RecordState>>,
    pub remote: Option<bool>,
    pub min_id: Option<RecordId>,
    pub hash: Option<String>,
    pub size: Option<u64>,
    /// Match the owner's identity of an ingested record.
    pub origin: Option<(DeviceId, RecordId)>,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl RecordQuery {
    /// The recent-record window used for content dedup.
    pub fn recent_window(window: usize) -> Self {
        Self {
            states: Some(vec![RecordState::Loading, RecordState::Loaded]),
            newest_first: true,
            limit: Some(window),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait PasteStore: Send + Sync {
    /// Persist a Loading placeholder and return its assigned id.
    async fn create_placeholder(&self, record: &PasteRecord) -> Result<RecordId, StoreError>;

    /// Flip Loading -> Loaded, storing the final item list and summary.
    /// Rejects any other source state.
    async fn finalize(&self, id: RecordId, items: &[PasteItem]) -> Result<(), StoreError>;

    /// Flip to Deleted (tombstone). Idempotent for already-deleted ids.
    async fn mark_deleted(&self, id: RecordId) -> Result<(), StoreError>;

    /// Physically remove a record row. Only valid for Deleted records.
    async fn purge(&self, id: RecordId) -> Result<(), StoreError>;

    async fn get(&self, id: RecordId) -> Result<Option<PasteRecord>, StoreError>;

    async fn query(&self, query: &RecordQuery) -> Result<Vec<PasteRecord>, StoreError>;

    async fn update_flag(
        &self,
        id: RecordId,
        flag: RecordFlag,
        value: bool,
    ) -> Result<(), StoreError>;

    /// Rewrite stored-file metadata after a pull-file task materialized
    /// payload bytes.
    async fn update_items(&self, id: RecordId, items: &[PasteItem]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn enqueue(
        &self,
        kind: TaskKind,
        record_id: Option<RecordId>,
        params: serde_json::Value,
    ) -> Result<i64, StoreError>;

    /// Atomically claim up to `limit` Pending tasks, flipping each to
    /// Executing, oldest first.
    async fn claim_pending(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError>;

    async fn update_task(
        &self,
        id: i64,
        status: TaskStatus,
        attempts: u32,
        last_error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>, StoreError>;

    /// Startup recovery: any task left Executing by a previous process
    /// goes back to Pending for at-least-once redelivery.
    async fn recover_executing(&self) -> Result<usize, StoreError>;

    /// Remove Success/Failure tasks older than `cutoff`.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Remove tasks whose associated record no longer exists.
    async fn purge_orphaned(&self) -> Result<usize, StoreError>;
}
