//! In-memory store backing unit tests

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::record::{PasteItem, PasteRecord, RecordId, RecordState};
use crate::tasks::{TaskKind, TaskRecord, TaskStatus};

use super::{PasteStore, RecordFlag, RecordQuery, StoreError, TaskStore};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<PasteRecord>>,
    tasks: RwLock<Vec<TaskRecord>>,
    next_record_id: AtomicI64,
    next_task_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            tasks: RwLock::new(Vec::new()),
            next_record_id: AtomicI64::new(1),
            next_task_id: AtomicI64::new(1),
        }
    }

    fn matches(record: &PasteRecord, query: &RecordQuery) -> bool {
        if let Some(states) = &query.states {
            if !states.contains(&record.state) {
                return false;
            }
        }
        if let Some(remote) = query.remote {
            if record.remote != remote {
                return false;
            }
        }
        if let Some(min_id) = query.min_id {
            if record.id < min_id {
                return false;
            }
        }
        if let Some(hash) = &query.hash {
            if &record.hash != hash {
                return false;
            }
        }
        if let Some(size) = query.size {
            if record.size != size {
                return false;
            }
        }
        if let Some((owner, origin_id)) = query.origin {
            if record.owner != owner || record.origin_id != Some(origin_id) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl PasteStore for MemoryStore {
    async fn create_placeholder(&self, record: &PasteRecord) -> Result<RecordId, StoreError> {
        let id = self.next_record_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = record.clone();
        stored.id = id;
        stored.state = RecordState::Loading;
        self.records.write().await.push(stored);
        Ok(id)
    }

    async fn finalize(&self, id: RecordId, items: &[PasteItem]) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if record.state != RecordState::Loading {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.state,
                to: RecordState::Loaded,
            });
        }
        record.items = items.to_vec();
        record.refresh_summary();
        record.state = RecordState::Loaded;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_deleted(&self, id: RecordId) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        record.state = RecordState::Deleted;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn purge(&self, id: RecordId) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| !(r.id == id && r.state == RecordState::Deleted));
        if records.len() == before {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<PasteRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<PasteRecord>, StoreError> {
        let records = self.records.read().await;
        let mut matched: Vec<PasteRecord> = records
            .iter()
            .filter(|r| Self::matches(r, query))
            .cloned()
            .collect();
        if query.newest_first {
            matched.sort_by(|a, b| b.id.cmp(&a.id));
        } else {
            matched.sort_by(|a, b| a.id.cmp(&b.id));
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn update_flag(
        &self,
        id: RecordId,
        flag: RecordFlag,
        value: bool,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        match flag {
            RecordFlag::Favorite => record.favorite = value,
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_items(&self, id: RecordId, items: &[PasteItem]) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        record.items = items.to_vec();
        record.refresh_summary();
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(
        &self,
        kind: TaskKind,
        record_id: Option<RecordId>,
        params: serde_json::Value,
    ) -> Result<i64, StoreError> {
        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        self.tasks.write().await.push(TaskRecord {
            id,
            kind,
            record_id,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            params,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn claim_pending(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let mut tasks = self.tasks.write().await;
        let mut claimed = Vec::new();
        for task in tasks.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Executing;
                task.updated_at = Utc::now();
                claimed.push(task.clone());
            }
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
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::TaskNotFound(id))?;
        task.status = status;
        task.attempts = attempts;
        if let Some(err) = last_error {
            task.last_error = Some(err.to_string());
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tasks.read().await.iter().find(|t| t.id == id).cloned())
    }

    async fn recover_executing(&self) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write().await;
        let mut count = 0;
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::Executing {
                task.status = TaskStatus::Pending;
                task.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|t| !(t.status.is_terminal() && t.updated_at < cutoff));
        Ok(before - tasks.len())
    }

    async fn purge_orphaned(&self) -> Result<usize, StoreError> {
        let records = self.records.read().await;
        let existing: std::collections::HashSet<RecordId> =
            records.iter().map(|r| r.id).collect();
        drop(records);

        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|t| match t.record_id {
            Some(record_id) => existing.contains(&record_id),
            None => true,
        });
        Ok(before - tasks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Payload, PasteItem};
    use uuid::Uuid;

    fn placeholder() -> PasteRecord {
        PasteRecord::placeholder(Uuid::new_v4(), None, false)
    }

    #[tokio::test]
    async fn placeholder_finalize_lifecycle() {
        let store = MemoryStore::new();
        let id = store.create_placeholder(&placeholder()).await.unwrap();
        assert_eq!(
            store.get(id).await.unwrap().unwrap().state,
            RecordState::Loading
        );

        let items = vec![PasteItem::new(Payload::Text("x".into()), vec![])];
        store.finalize(id, &items).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Loaded);
        assert_eq!(record.items.len(), 1);
        assert!(record.size > 0);

        // Finalizing twice violates Loading -> Loaded at-most-once.
        assert!(matches!(
            store.finalize(id, &items).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let store = MemoryStore::new();
        let a = store.create_placeholder(&placeholder()).await.unwrap();
        let b = store.create_placeholder(&placeholder()).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn purge_requires_tombstone() {
        let store = MemoryStore::new();
        let id = store.create_placeholder(&placeholder()).await.unwrap();
        assert!(store.purge(id).await.is_err());
        store.mark_deleted(id).await.unwrap();
        store.purge(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
    }
}
