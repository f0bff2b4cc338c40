//! Stock task handlers
//!
//! Every handler is safe under at-least-once execution: re-running a
//! completed task finds its work already done and returns success.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::record::{PasteRecord, PayloadKind, RecordState};
use crate::render::Renderer as _;
use crate::store::{PasteStore as _, RecordQuery, TaskStore as _};
use crate::sync::{PeerClient as _, FILE_CHUNK_LEN};

use super::{FollowOn, TaskContext, TaskError, TaskHandler, TaskKind, TaskRecord};

fn record_dir(ctx: &TaskContext, record: &PasteRecord) -> std::path::PathBuf {
    ctx.data_dir
        .join(record.owner.to_string())
        .join(record.id.to_string())
}

async fn load_record(
    ctx: &TaskContext,
    task: &TaskRecord,
) -> Result<Option<PasteRecord>, TaskError> {
    let id = task
        .record_id
        .ok_or_else(|| TaskError::BadParams("task has no record id".into()))?;
    Ok(ctx.store.get(id).await?)
}

/// Fetch one stored payload file from the peer owning the record,
/// chunked and resumable from the bytes already on disk.
pub struct PullFileHandler;

#[async_trait]
impl TaskHandler for PullFileHandler {
    async fn run(&self, ctx: &TaskContext, task: &TaskRecord) -> Result<Vec<FollowOn>, TaskError> {
        let Some(record) = load_record(ctx, task).await? else {
            return Ok(Vec::new());
        };
        if record.state != RecordState::Loaded {
            return Ok(Vec::new());
        }
        let relative_path = task
            .params
            .get("relative_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TaskError::BadParams("missing relative_path".into()))?
            .to_string();

        let Some(wanted) = record
            .stored_files()
            .into_iter()
            .find(|f| f.relative_path == relative_path)
            .cloned()
        else {
            debug!(record = record.id, path = %relative_path, "stored file no longer referenced");
            return Ok(Vec::new());
        };
        if wanted.present {
            return Ok(Vec::new());
        }

        let origin_id = record.origin_id.unwrap_or(record.id);
        let dir = record_dir(ctx, &record);
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(&relative_path);

        // Resume from whatever a previous attempt already fetched.
        let mut offset = match tokio::fs::metadata(&dest).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&dest)
            .await?;

        loop {
            let chunk = ctx
                .peer_client
                .pull_file_chunk(record.owner, origin_id, &relative_path, offset, FILE_CHUNK_LEN)
                .await?;
            if !chunk.bytes.is_empty() {
                file.write_all(&chunk.bytes).await?;
                offset += chunk.bytes.len() as u64;
            }
            if chunk.eof {
                break;
            }
            if chunk.bytes.is_empty() {
                return Err(TaskError::BadParams("peer sent empty non-final chunk".into()));
            }
        }
        file.flush().await?;
        drop(file);

        let bytes = tokio::fs::read(&dest).await?;
        let hash = hex::encode(Sha256::digest(&bytes));
        if !wanted.hash.is_empty() && hash != wanted.hash {
            // Corrupt transfer: start over on the next attempt.
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(TaskError::BadParams(format!(
                "hash mismatch for {relative_path}"
            )));
        }

        let mut items = record.items.clone();
        for item in items.iter_mut() {
            if let Some(files) = item.payload.stored_files_mut() {
                for f in files.iter_mut() {
                    if f.relative_path == relative_path {
                        f.present = true;
                        f.size = bytes.len() as u64;
                        f.hash = hash.clone();
                    }
                }
            }
            item.refresh_summary();
        }
        ctx.store.update_items(record.id, &items).await?;
        info!(record = record.id, path = %relative_path, bytes = bytes.len(), "pulled file");

        // Once the last file lands, markup-bearing records get a preview.
        let updated = ctx.store.get(record.id).await?;
        let mut follow_ons = Vec::new();
        if let Some(updated) = updated {
            let has_markup =
                updated.has_kind(PayloadKind::Html) || updated.has_kind(PayloadKind::Rtf);
            let all_present = updated.stored_files().iter().all(|f| f.present);
            if has_markup && all_present {
                follow_ons.push(FollowOn {
                    kind: TaskKind::RenderMarkup,
                    record_id: Some(updated.id),
                    params: serde_json::json!({}),
                });
            }
        }
        Ok(follow_ons)
    }
}

/// Fetch a peer's device icon into the local data directory.
pub struct PullDeviceIconHandler;

#[async_trait]
impl TaskHandler for PullDeviceIconHandler {
    async fn run(&self, ctx: &TaskContext, task: &TaskRecord) -> Result<Vec<FollowOn>, TaskError> {
        let device: Uuid = task
            .params
            .get("device_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| TaskError::BadParams("missing device_id".into()))?;

        let bytes = ctx.peer_client.pull_device_icon(device).await?;
        if bytes.is_empty() {
            debug!(peer = %device, "peer has no icon");
            return Ok(Vec::new());
        }
        let dir = ctx.data_dir.join("icons");
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(format!("{device}.png")), &bytes).await?;
        Ok(Vec::new())
    }
}

/// Render a record's markup item to a preview bitmap via the renderer
/// port.
pub struct RenderMarkupHandler;

#[async_trait]
impl TaskHandler for RenderMarkupHandler {
    async fn run(&self, ctx: &TaskContext, task: &TaskRecord) -> Result<Vec<FollowOn>, TaskError> {
        let Some(record) = load_record(ctx, task).await? else {
            return Ok(Vec::new());
        };
        if record.state != RecordState::Loaded {
            return Ok(Vec::new());
        }

        let markup = match record.item_of_kind(PayloadKind::Html) {
            Some(item) => match &item.payload {
                crate::record::Payload::Html(html) => html.clone(),
                _ => return Ok(Vec::new()),
            },
            None => match record.item_of_kind(PayloadKind::Rtf) {
                Some(item) => match &item.payload {
                    crate::record::Payload::Rtf(bytes) => {
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                    _ => return Ok(Vec::new()),
                },
                None => return Ok(Vec::new()),
            },
        };

        let dir = record_dir(ctx, &record);
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join("preview.png");
        ctx.renderer.render(&markup, &dest).await?;
        debug!(record = record.id, "rendered markup preview");
        Ok(Vec::new())
    }
}

/// Push one loaded local record to every paired peer.
pub struct SyncRecordHandler;

#[async_trait]
impl TaskHandler for SyncRecordHandler {
    async fn run(&self, ctx: &TaskContext, task: &TaskRecord) -> Result<Vec<FollowOn>, TaskError> {
        let Some(record) = load_record(ctx, task).await? else {
            return Ok(Vec::new());
        };
        if record.state != RecordState::Loaded || record.remote {
            return Ok(Vec::new());
        }
        ctx.peer_client.push_record(&record).await?;
        Ok(Vec::new())
    }
}

/// Remove a tombstoned record's payload files.
pub struct DeleteRecordHandler;

#[async_trait]
impl TaskHandler for DeleteRecordHandler {
    async fn run(&self, ctx: &TaskContext, task: &TaskRecord) -> Result<Vec<FollowOn>, TaskError> {
        let Some(record) = load_record(ctx, task).await? else {
            return Ok(Vec::new());
        };
        if record.state != RecordState::Deleted {
            return Ok(Vec::new());
        }
        let dir = record_dir(ctx, &record);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(record = record.id, "removed payload files"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Vec::new())
    }
}

/// Queue hygiene: drop terminal tasks past retention, tasks whose record
/// is gone, and tombstones old enough that every peer must have seen
/// them.
pub struct CleanupOrphansHandler;

#[async_trait]
impl TaskHandler for CleanupOrphansHandler {
    async fn run(&self, ctx: &TaskContext, _task: &TaskRecord) -> Result<Vec<FollowOn>, TaskError> {
        let task_cutoff = Utc::now() - ctx.task_retention;
        let purged = ctx.tasks.purge_terminal_before(task_cutoff).await?;
        let orphaned = ctx.tasks.purge_orphaned().await?;

        let tombstone_cutoff = Utc::now() - ctx.tombstone_retention;
        let tombstones = ctx
            .store
            .query(&RecordQuery {
                states: Some(vec![RecordState::Deleted]),
                ..Default::default()
            })
            .await?;
        let mut expired = 0usize;
        for tombstone in tombstones {
            if tombstone.updated_at < tombstone_cutoff {
                let dir = record_dir(ctx, &tombstone);
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(record = tombstone.id, "failed to remove payload dir: {e}");
                    }
                }
                ctx.store.purge(tombstone.id).await?;
                expired += 1;
            }
        }

        if purged + orphaned + expired > 0 {
            info!(purged, orphaned, expired, "cleanup pass complete");
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PasteItem, Payload, StoredFile};
    use crate::render::RecordingRenderer;
    use crate::store::{MemoryStore, PasteStore, TaskStore};
    use crate::sync::{FileChunk, PeerClient, SyncError};
    use crate::tasks::TaskStatus;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct ScriptedPeerClient {
        chunks: Mutex<Vec<FileChunk>>,
        requested_offsets: Mutex<Vec<u64>>,
    }

    impl ScriptedPeerClient {
        fn new(chunks: Vec<FileChunk>) -> Self {
            Self {
                chunks: Mutex::new(chunks),
                requested_offsets: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PeerClient for ScriptedPeerClient {
        async fn push_record(&self, _record: &PasteRecord) -> Result<(), SyncError> {
            Ok(())
        }

        async fn pull_file_chunk(
            &self,
            _owner: Uuid,
            _record_id: i64,
            _relative_path: &str,
            offset: u64,
            _len: u32,
        ) -> Result<FileChunk, SyncError> {
            self.requested_offsets.lock().await.push(offset);
            let mut chunks = self.chunks.lock().await;
            if chunks.is_empty() {
                return Err(SyncError::Protocol("no more chunks".into()));
            }
            Ok(chunks.remove(0))
        }

        async fn pull_device_icon(&self, _device: Uuid) -> Result<Vec<u8>, SyncError> {
            Ok(b"icon-bytes".to_vec())
        }
    }

    fn ctx_with(
        store: Arc<MemoryStore>,
        peer_client: Arc<dyn PeerClient>,
        renderer: Arc<RecordingRenderer>,
        data_dir: std::path::PathBuf,
    ) -> TaskContext {
        TaskContext {
            store: store.clone(),
            tasks: store,
            renderer,
            peer_client,
            data_dir,
            task_retention: chrono::Duration::hours(24),
            tombstone_retention: chrono::Duration::days(7),
        }
    }

    async fn seed_remote_record(store: &MemoryStore, payload_hash: String) -> PasteRecord {
        let mut record = PasteRecord::placeholder(Uuid::new_v4(), None, true);
        record.origin_id = Some(90);
        let id = store.create_placeholder(&record).await.unwrap();
        let items = vec![PasteItem::new(
            Payload::ImageSet(vec![StoredFile {
                relative_path: "image-0.png".into(),
                size: 0,
                hash: payload_hash,
                present: false,
            }]),
            vec!["image/png".into()],
        )];
        store.finalize(id, &items).await.unwrap();
        store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn pull_file_fetches_chunks_and_marks_present() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let payload = b"abcdefghij".to_vec();
        let hash = hex::encode(Sha256::digest(&payload));
        let record = seed_remote_record(&store, hash.clone()).await;

        let client = Arc::new(ScriptedPeerClient::new(vec![
            FileChunk {
                bytes: payload[..4].to_vec(),
                eof: false,
            },
            FileChunk {
                bytes: payload[4..].to_vec(),
                eof: true,
            },
        ]));
        let ctx = ctx_with(
            store.clone(),
            client.clone(),
            Arc::new(RecordingRenderer::new()),
            tmp.path().to_path_buf(),
        );

        let task_id = store
            .enqueue(
                TaskKind::PullFile,
                Some(record.id),
                serde_json::json!({"relative_path": "image-0.png"}),
            )
            .await
            .unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();

        let follow_ons = PullFileHandler.run(&ctx, &task).await.unwrap();
        assert!(follow_ons.is_empty()); // no markup item

        let updated = store.get(record.id).await.unwrap().unwrap();
        let file = &updated.stored_files()[0];
        assert!(file.present);
        assert_eq!(file.size, 10);
        assert_eq!(file.hash, hash);

        let on_disk = tokio::fs::read(
            ctx.data_dir
                .join(record.owner.to_string())
                .join(record.id.to_string())
                .join("image-0.png"),
        )
        .await
        .unwrap();
        assert_eq!(on_disk, payload);

        // Both chunk requests, second resumed at offset 4.
        assert_eq!(*client.requested_offsets.lock().await, vec![0, 4]);
    }

    #[tokio::test]
    async fn pull_file_resumes_from_partial_download() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let payload = b"0123456789".to_vec();
        let hash = hex::encode(Sha256::digest(&payload));
        let record = seed_remote_record(&store, hash).await;

        // A previous attempt already wrote the first half.
        let dir = tmp
            .path()
            .join(record.owner.to_string())
            .join(record.id.to_string());
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("image-0.png"), &payload[..5])
            .await
            .unwrap();

        let client = Arc::new(ScriptedPeerClient::new(vec![FileChunk {
            bytes: payload[5..].to_vec(),
            eof: true,
        }]));
        let ctx = ctx_with(
            store.clone(),
            client.clone(),
            Arc::new(RecordingRenderer::new()),
            tmp.path().to_path_buf(),
        );

        let task_id = store
            .enqueue(
                TaskKind::PullFile,
                Some(record.id),
                serde_json::json!({"relative_path": "image-0.png"}),
            )
            .await
            .unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        PullFileHandler.run(&ctx, &task).await.unwrap();

        assert_eq!(*client.requested_offsets.lock().await, vec![5]);
        let on_disk = tokio::fs::read(dir.join("image-0.png")).await.unwrap();
        assert_eq!(on_disk, payload);
    }

    #[tokio::test]
    async fn pull_file_hash_mismatch_restarts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let record = seed_remote_record(&store, "expected-other-hash".into()).await;

        let client = Arc::new(ScriptedPeerClient::new(vec![FileChunk {
            bytes: b"corrupt".to_vec(),
            eof: true,
        }]));
        let ctx = ctx_with(
            store.clone(),
            client,
            Arc::new(RecordingRenderer::new()),
            tmp.path().to_path_buf(),
        );

        let task_id = store
            .enqueue(
                TaskKind::PullFile,
                Some(record.id),
                serde_json::json!({"relative_path": "image-0.png"}),
            )
            .await
            .unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert!(PullFileHandler.run(&ctx, &task).await.is_err());

        // The partial file is gone so the retry starts clean.
        let dest = tmp
            .path()
            .join(record.owner.to_string())
            .join(record.id.to_string())
            .join("image-0.png");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn render_markup_writes_preview() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let renderer = Arc::new(RecordingRenderer::new());

        let record = PasteRecord::placeholder(Uuid::new_v4(), None, false);
        let id = store.create_placeholder(&record).await.unwrap();
        store
            .finalize(
                id,
                &[PasteItem::new(
                    Payload::Html("<b>preview me</b>".into()),
                    vec![],
                )],
            )
            .await
            .unwrap();

        let ctx = ctx_with(
            store.clone(),
            Arc::new(crate::sync::NullPeerClient),
            renderer.clone(),
            tmp.path().to_path_buf(),
        );
        let task_id = store
            .enqueue(TaskKind::RenderMarkup, Some(id), serde_json::json!({}))
            .await
            .unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        RenderMarkupHandler.run(&ctx, &task).await.unwrap();

        let calls = renderer.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "<b>preview me</b>");
        assert!(calls[0].1.ends_with("preview.png"));
    }

    #[tokio::test]
    async fn delete_record_removes_payload_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let record = PasteRecord::placeholder(Uuid::new_v4(), None, false);
        let id = store.create_placeholder(&record).await.unwrap();
        store
            .finalize(id, &[PasteItem::new(Payload::Text("x".into()), vec![])])
            .await
            .unwrap();
        store.mark_deleted(id).await.unwrap();
        let stored = store.get(id).await.unwrap().unwrap();

        let dir = tmp
            .path()
            .join(stored.owner.to_string())
            .join(stored.id.to_string());
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("blob"), b"x").await.unwrap();

        let ctx = ctx_with(
            store.clone(),
            Arc::new(crate::sync::NullPeerClient),
            Arc::new(RecordingRenderer::new()),
            tmp.path().to_path_buf(),
        );
        let task_id = store
            .enqueue(TaskKind::DeleteRecord, Some(id), serde_json::json!({}))
            .await
            .unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        DeleteRecordHandler.run(&ctx, &task).await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn cleanup_purges_terminal_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctx = ctx_with(
            store.clone(),
            Arc::new(crate::sync::NullPeerClient),
            Arc::new(RecordingRenderer::new()),
            tmp.path().to_path_buf(),
        );

        let old = store
            .enqueue(TaskKind::SyncRecord, None, serde_json::json!({}))
            .await
            .unwrap();
        // Terminal long ago: retention window is 24h, so backdating is
        // simulated by a zero-retention context.
        store
            .update_task(old, TaskStatus::Success, 0, None)
            .await
            .unwrap();
        let mut fast_ctx = ctx;
        fast_ctx.task_retention = chrono::Duration::zero() - chrono::Duration::seconds(1);

        let cleanup_id = store
            .enqueue(TaskKind::CleanupOrphans, None, serde_json::json!({}))
            .await
            .unwrap();
        let task = store.get_task(cleanup_id).await.unwrap().unwrap();
        CleanupOrphansHandler.run(&fast_ctx, &task).await.unwrap();

        assert!(store.get_task(old).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pull_icon_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedPeerClient::new(Vec::new()));
        let ctx = ctx_with(
            store.clone(),
            client,
            Arc::new(RecordingRenderer::new()),
            tmp.path().to_path_buf(),
        );

        let device = Uuid::new_v4();
        let task_id = store
            .enqueue(
                TaskKind::PullDeviceIcon,
                None,
                serde_json::json!({"device_id": device.to_string()}),
            )
            .await
            .unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        PullDeviceIconHandler.run(&ctx, &task).await.unwrap();

        let icon = tokio::fs::read(tmp.path().join("icons").join(format!("{device}.png")))
            .await
            .unwrap();
        assert_eq!(icon, b"icon-bytes");
    }
}
