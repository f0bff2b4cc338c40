//! Collection sessions
//!
//! One session per capture episode, local or remote: build items from
//! flavor slots through the plugin registry, persist a Loading
//! placeholder, materialize payload bodies to the data directory, run
//! the post-process chain, then finalize. A session that collects
//! nothing, or loses every item to materialization failure, deletes its
//! placeholder instead of leaving it Loading.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clipboard::FlavorSlot;
use crate::plugins::{Blob, BlobSource, BuiltItem, PluginRegistry};
use crate::postprocess::{PostAction, PostContext, PostProcessChain, PostProcessError};
use crate::record::{
    DeviceId, PasteItem, PasteRecord, PayloadKind, RecordEvent, RecordId,
};
use crate::store::{PasteStore, RecordFlag, StoreError, TaskStore};
use crate::tasks::TaskKind;
use crate::util::StripedMutex;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("post-process error: {0}")]
    PostProcess(#[from] PostProcessError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared collection machinery; every capture episode runs through one
/// instance of this.
pub struct Collector {
    device_id: DeviceId,
    store: Arc<dyn PasteStore>,
    tasks: Arc<dyn TaskStore>,
    plugins: Arc<PluginRegistry>,
    chain: Arc<PostProcessChain>,
    post_ctx: PostContext,
    data_dir: PathBuf,
    events: broadcast::Sender<RecordEvent>,
    materialize_locks: StripedMutex,
}

impl Collector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: DeviceId,
        store: Arc<dyn PasteStore>,
        tasks: Arc<dyn TaskStore>,
        plugins: Arc<PluginRegistry>,
        chain: Arc<PostProcessChain>,
        data_dir: PathBuf,
        dedup_window: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        let post_ctx = PostContext {
            store: Arc::clone(&store),
            dedup_window,
        };
        Self {
            device_id,
            store,
            tasks,
            plugins,
            chain,
            post_ctx,
            data_dir,
            events,
            materialize_locks: StripedMutex::new(16),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }

    pub fn record_dir(&self, owner: DeviceId, id: RecordId) -> PathBuf {
        self.data_dir.join(owner.to_string()).join(id.to_string())
    }

    /// Run a collection session over locally captured flavor slots.
    /// Returns the new record id, or `None` when nothing was collected
    /// or the record was discarded by post-processing.
    pub async fn capture_local(
        &self,
        slots: Vec<FlavorSlot>,
        source_app: Option<String>,
    ) -> Result<Option<RecordId>, CollectError> {
        let built = self.build_items(&slots);
        let record = PasteRecord::placeholder(self.device_id, source_app, false);
        self.run_session(record, built).await
    }

    /// Ingest a record received from a peer through the same session
    /// machinery, tagged remote. Stored-file bytes stay absent until the
    /// pull-file task fetches them.
    pub async fn ingest_remote(&self, remote: PasteRecord) -> Result<Option<RecordId>, CollectError> {
        let mut record = PasteRecord::placeholder(remote.owner, remote.source_app.clone(), true);
        record.origin_id = Some(remote.id);
        record.created_at = remote.created_at;
        record.favorite = remote.favorite;
        record.tags = remote.tags.clone();

        let built = remote
            .items
            .into_iter()
            .map(|mut item| {
                let mut blobs = Vec::new();
                if let Some(files) = item.payload.stored_files_mut() {
                    for file in files.iter_mut() {
                        file.present = false;
                        blobs.push(Blob {
                            relative_path: file.relative_path.clone(),
                            source: BlobSource::Remote,
                        });
                    }
                }
                BuiltItem { item, blobs }
            })
            .collect();

        self.run_session(record, built).await
    }

    /// Build one item per claimed slot, in native enumeration order.
    /// Exactly one build attempt per (slot, plugin-category) pair; a
    /// category that already produced an item skips later slots.
    fn build_items(&self, slots: &[FlavorSlot]) -> Vec<BuiltItem> {
        let mut built: Vec<BuiltItem> = Vec::new();
        let mut seen_kinds: HashSet<PayloadKind> = HashSet::new();

        for slot in slots {
            let plugin = match self.plugins.plugin_for_flavor(&slot.flavor) {
                Some(plugin) => plugin,
                None => {
                    debug!(flavor = %slot.flavor, "no plugin claims flavor, skipping slot");
                    continue;
                }
            };
            if seen_kinds.contains(&plugin.kind()) {
                continue;
            }
            match plugin.build(slot) {
                Ok(Some(item)) => {
                    seen_kinds.insert(plugin.kind());
                    built.push(item);
                }
                Ok(None) => {}
                Err(e) => {
                    // Corrupt slot data drops the slot, never the session.
                    warn!(flavor = %slot.flavor, "slot failed validation: {e}");
                }
            }
        }
        built
    }

    async fn run_session(
        &self,
        mut record: PasteRecord,
        built: Vec<BuiltItem>,
    ) -> Result<Option<RecordId>, CollectError> {
        let id = self.store.create_placeholder(&record).await?;
        record.id = id;

        if built.is_empty() {
            debug!(record = id, "session collected nothing, deleting placeholder");
            self.discard_placeholder(id).await;
            return Ok(None);
        }

        // Item bodies materialize only after the placeholder persist.
        let items = match self.materialize(&record, built).await {
            Ok(items) if !items.is_empty() => items,
            Ok(_) => {
                info!(record = id, "all items lost during materialization");
                self.discard_placeholder(id).await;
                return Ok(None);
            }
            Err(e) => {
                warn!(record = id, "materialization failed: {e}");
                self.discard_placeholder(id).await;
                return Ok(None);
            }
        };

        record.items = items;
        record.refresh_summary();

        match self.chain.run(&self.post_ctx, &mut record).await? {
            PostAction::Discard(reason) => {
                debug!(record = id, %reason, "post-process discarded record");
                self.discard_placeholder(id).await;
                return Ok(None);
            }
            PostAction::Continue => {}
        }

        if record.items.is_empty() {
            self.discard_placeholder(id).await;
            return Ok(None);
        }

        self.store.finalize(id, &record.items).await?;
        record.state = crate::record::RecordState::Loaded;
        record.updated_at = Utc::now();

        self.enqueue_followups(&record).await;

        debug!(record = id, items = record.items.len(), remote = record.remote, "record loaded");
        let _ = self.events.send(RecordEvent::Loaded(record));
        Ok(Some(id))
    }

    /// Write blob bytes under the record's payload directory and fill in
    /// stored-file metadata. Items whose materialization fails are
    /// dropped; the session continues with the rest.
    async fn materialize(
        &self,
        record: &PasteRecord,
        built: Vec<BuiltItem>,
    ) -> Result<Vec<PasteItem>, CollectError> {
        let _guard = self.materialize_locks.lock(&record.id).await;
        let dir = self.record_dir(record.owner, record.id);

        let mut items = Vec::with_capacity(built.len());
        'next_item: for BuiltItem { mut item, blobs } in built {
            for blob in &blobs {
                match &blob.source {
                    BlobSource::Bytes(bytes) => {
                        tokio::fs::create_dir_all(&dir).await?;
                        let dest = dir.join(&blob.relative_path);
                        if let Err(e) = tokio::fs::write(&dest, bytes).await {
                            warn!(record = record.id, path = %dest.display(), "failed to write payload: {e}");
                            continue 'next_item;
                        }
                        set_file_meta(
                            &mut item,
                            &blob.relative_path,
                            bytes.len() as u64,
                            hex::encode(Sha256::digest(bytes)),
                            true,
                        );
                    }
                    BlobSource::LocalFile(source) => {
                        tokio::fs::create_dir_all(&dir).await?;
                        let dest = dir.join(&blob.relative_path);
                        let bytes = match tokio::fs::read(source).await {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(record = record.id, path = %source.display(), "failed to read source file: {e}");
                                continue 'next_item;
                            }
                        };
                        if let Err(e) = tokio::fs::write(&dest, &bytes).await {
                            warn!(record = record.id, path = %dest.display(), "failed to copy payload: {e}");
                            continue 'next_item;
                        }
                        set_file_meta(
                            &mut item,
                            &blob.relative_path,
                            bytes.len() as u64,
                            hex::encode(Sha256::digest(&bytes)),
                            true,
                        );
                    }
                    BlobSource::Remote => {
                        // Bytes arrive later via the pull-file task.
                    }
                }
            }
            item.refresh_summary();
            items.push(item);
        }
        Ok(items)
    }

    async fn enqueue_followups(&self, record: &PasteRecord) {
        if record.remote {
            for file in record.stored_files() {
                if !file.present {
                    let params = serde_json::json!({ "relative_path": file.relative_path });
                    if let Err(e) = self
                        .tasks
                        .enqueue(TaskKind::PullFile, Some(record.id), params)
                        .await
                    {
                        warn!(record = record.id, "failed to enqueue pull-file task: {e}");
                    }
                }
            }
        }
        let needs_preview = record.has_kind(PayloadKind::Html) || record.has_kind(PayloadKind::Rtf);
        let all_present = record.stored_files().iter().all(|f| f.present);
        if needs_preview && all_present {
            if let Err(e) = self
                .tasks
                .enqueue(TaskKind::RenderMarkup, Some(record.id), serde_json::json!({}))
                .await
            {
                warn!(record = record.id, "failed to enqueue render task: {e}");
            }
        }
    }

    /// Remove a placeholder that must not become visible. Best effort;
    /// the row is tombstoned then purged.
    async fn discard_placeholder(&self, id: RecordId) {
        if let Err(e) = self.store.mark_deleted(id).await {
            warn!(record = id, "failed to roll back placeholder: {e}");
            return;
        }
        if let Err(e) = self.store.purge(id).await {
            warn!(record = id, "failed to purge discarded placeholder: {e}");
        }
    }

    /// User-facing delete: tombstone the record, clean payload files via
    /// a task, and tell peers.
    pub async fn delete_record(&self, id: RecordId) -> Result<(), CollectError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        self.store.mark_deleted(id).await?;
        let deleted_at = Utc::now();
        if let Err(e) = self
            .tasks
            .enqueue(TaskKind::DeleteRecord, Some(id), serde_json::json!({}))
            .await
        {
            warn!(record = id, "failed to enqueue delete cleanup: {e}");
        }
        let _ = self.events.send(RecordEvent::Deleted {
            owner: record.owner,
            record_id: record.origin_id.unwrap_or(id),
            deleted_at,
        });
        Ok(())
    }

    /// Toggle the favorite flag and notify peers.
    pub async fn set_favorite(&self, id: RecordId, value: bool) -> Result<(), CollectError> {
        self.store
            .update_flag(id, RecordFlag::Favorite, value)
            .await?;
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let _ = self.events.send(RecordEvent::FlagChanged {
            owner: record.owner,
            record_id: record.origin_id.unwrap_or(id),
            favorite: value,
            updated_at: record.updated_at,
        });
        Ok(())
    }
}

fn set_file_meta(item: &mut PasteItem, relative_path: &str, size: u64, hash: String, present: bool) {
    if let Some(files) = item.payload.stored_files_mut() {
        for file in files.iter_mut() {
            if file.relative_path == relative_path {
                file.size = size;
                file.hash = hash.clone();
                file.present = present;
            }
        }
    }
}
