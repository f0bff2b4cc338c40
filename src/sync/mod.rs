//! Sync manager
//!
//! Pushes newly loaded local records to every paired peer, answers
//! inbound pull/list/tombstone traffic, and feeds received records back
//! through the same collection pipeline used for local capture. All
//! peer traffic is encrypted with the per-peer session key; concurrent
//! peer operations share one semaphore to cap fan-out.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::collect::{CollectError, Collector};
use crate::discovery::DiscoveredPeer;
use crate::net::{NetError, RequestHandler, Transport, WireEnvelope, WireKind};
use crate::pairing::{PairingError, PairingManager, SignedPairing};
use crate::peers::{PeerDevice, PeerRegistry};
use crate::record::{DeviceId, PasteRecord, RecordEvent, RecordId, RecordState};
use crate::store::{PasteStore, RecordFlag, RecordQuery, StoreError, TaskStore};
use crate::tasks::TaskKind;
use crate::util::FileIndexCache;

pub mod protocol;

pub use protocol::{RecordHeader, SyncMessage, FILE_CHUNK_LEN};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("collect error: {0}")]
    Collect(#[from] CollectError),

    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("transport error: {0}")]
    Net(#[from] NetError),

    #[error("peer {0} is not paired")]
    Untrusted(DeviceId),

    #[error("peer {0} has no known endpoint")]
    NoEndpoint(DeviceId),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One pulled file chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub bytes: Vec<u8>,
    pub eof: bool,
}

/// Outbound peer operations consumed by task handlers.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Push one record to every paired peer.
    async fn push_record(&self, record: &PasteRecord) -> Result<(), SyncError>;

    /// Pull a byte range of a stored file from the peer owning it.
    async fn pull_file_chunk(
        &self,
        owner: DeviceId,
        record_id: RecordId,
        relative_path: &str,
        offset: u64,
        len: u32,
    ) -> Result<FileChunk, SyncError>;

    /// Fetch a peer's device icon bytes.
    async fn pull_device_icon(&self, device: DeviceId) -> Result<Vec<u8>, SyncError>;
}

/// Inert client for tests and single-device deployments.
pub struct NullPeerClient;

#[async_trait]
impl PeerClient for NullPeerClient {
    async fn push_record(&self, _record: &PasteRecord) -> Result<(), SyncError> {
        Ok(())
    }

    async fn pull_file_chunk(
        &self,
        _owner: DeviceId,
        _record_id: RecordId,
        _relative_path: &str,
        _offset: u64,
        _len: u32,
    ) -> Result<FileChunk, SyncError> {
        Ok(FileChunk {
            bytes: Vec::new(),
            eof: true,
        })
    }

    async fn pull_device_icon(&self, _device: DeviceId) -> Result<Vec<u8>, SyncError> {
        Ok(Vec::new())
    }
}

pub struct SyncManager {
    device_id: DeviceId,
    registry: Arc<PeerRegistry>,
    store: Arc<dyn PasteStore>,
    tasks: Arc<dyn TaskStore>,
    transport: Arc<dyn Transport>,
    collector: Arc<Collector>,
    pairing: Arc<PairingManager>,
    fanout: Semaphore,
    data_dir: PathBuf,
    /// Cached per-record payload indexes, used to confirm every
    /// advertised file is really on disk before peers start pulling.
    file_index: FileIndexCache,
    stop_tx: watch::Sender<bool>,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: DeviceId,
        registry: Arc<PeerRegistry>,
        store: Arc<dyn PasteStore>,
        tasks: Arc<dyn TaskStore>,
        transport: Arc<dyn Transport>,
        collector: Arc<Collector>,
        pairing: Arc<PairingManager>,
        fanout_limit: usize,
        data_dir: PathBuf,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let file_index = FileIndexCache::new(
            data_dir.clone(),
            256,
            std::time::Duration::from_secs(60),
        );
        Self {
            device_id,
            registry,
            store,
            tasks,
            transport,
            collector,
            pairing,
            fanout: Semaphore::new(fanout_limit.max(1)),
            data_dir,
            file_index,
            stop_tx,
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Drive outbound sync: record events become push tasks or
    /// tombstone/flag broadcasts, discovery observations refresh the
    /// peer registry.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<RecordEvent>,
        mut discoveries: mpsc::Receiver<DiscoveredPeer>,
    ) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut discovery_open = true;
        info!("sync manager running");

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(RecordEvent::Loaded(record)) if !record.remote => {
                        if let Err(e) = self
                            .tasks
                            .enqueue(TaskKind::SyncRecord, Some(record.id), serde_json::json!({}))
                            .await
                        {
                            warn!(record = record.id, "failed to enqueue sync task: {e}");
                        }
                    }
                    Ok(RecordEvent::Loaded(_)) => {}
                    Ok(RecordEvent::Deleted { owner, record_id, deleted_at }) => {
                        self.broadcast(&SyncMessage::Tombstone { owner, record_id, deleted_at })
                            .await;
                    }
                    Ok(RecordEvent::FlagChanged { owner, record_id, favorite, updated_at }) => {
                        self.broadcast(&SyncMessage::FlagUpdate {
                            owner,
                            record_id,
                            favorite,
                            updated_at,
                        })
                        .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(count, "sync manager lagged behind record events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                peer = discoveries.recv(), if discovery_open => match peer {
                    Some(discovered) => self.registry.observe_discovered(&discovered).await,
                    None => discovery_open = false,
                },
            }
        }
        info!("sync manager stopped");
    }

    /// Best-effort broadcast to all paired peers.
    async fn broadcast(&self, message: &SyncMessage) {
        for peer in self.registry.paired_peers().await {
            if let Err(e) = self.send_to_peer(&peer, message).await {
                warn!(peer = %peer.id, "broadcast failed: {e}");
            }
        }
    }

    /// Encrypt and send one message to one peer, bounded by the shared
    /// fan-out semaphore, and decrypt the reply.
    async fn send_to_peer(
        &self,
        peer: &PeerDevice,
        message: &SyncMessage,
    ) -> Result<SyncMessage, SyncError> {
        let key = peer
            .session_key
            .clone()
            .ok_or(SyncError::Untrusted(peer.id))?;
        let endpoint = peer
            .endpoint
            .clone()
            .ok_or(SyncError::NoEndpoint(peer.id))?;

        let sealed = key.seal(&serde_json::to_vec(message)?)?;
        let envelope = WireEnvelope::new(self.device_id, WireKind::Sync, sealed);

        let _permit = self
            .fanout
            .acquire()
            .await
            .map_err(|_| SyncError::Protocol("sync manager shut down".into()))?;
        let reply = self.transport.request(&endpoint, envelope).await?;

        match reply.kind {
            WireKind::Sync => {
                let plain = key.open(&reply.body)?;
                Ok(serde_json::from_slice(&plain)?)
            }
            WireKind::Ack => Ok(SyncMessage::Ack),
            WireKind::Error => Err(SyncError::Protocol(
                String::from_utf8_lossy(&reply.body).into_owned(),
            )),
            other => Err(SyncError::Protocol(format!(
                "unexpected reply kind {other:?}"
            ))),
        }
    }

    /// Resolve the local copy of `(owner, record_id)`: our own records
    /// by id, ingested ones by origin.
    async fn resolve_record(
        &self,
        owner: DeviceId,
        record_id: RecordId,
    ) -> Result<Option<PasteRecord>, SyncError> {
        if owner == self.device_id {
            return Ok(self.store.get(record_id).await?);
        }
        let hits = self
            .store
            .query(&RecordQuery {
                origin: Some((owner, record_id)),
                limit: Some(1),
                ..Default::default()
            })
            .await?;
        Ok(hits.into_iter().next())
    }

    async fn dispatch(&self, from: DeviceId, message: SyncMessage) -> SyncMessage {
        match self.dispatch_inner(from, message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(peer = %from, "sync request failed: {e}");
                SyncMessage::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    async fn dispatch_inner(
        &self,
        from: DeviceId,
        message: SyncMessage,
    ) -> Result<SyncMessage, SyncError> {
        match message {
            SyncMessage::Push { record } => {
                debug!(peer = %from, origin = record.id, "ingesting pushed record");
                // Replayed pushes die in the dedup processor.
                self.collector.ingest_remote(record).await?;
                Ok(SyncMessage::Ack)
            }
            SyncMessage::PullList { since } => {
                let records = self
                    .store
                    .query(&RecordQuery {
                        states: Some(vec![RecordState::Loaded]),
                        remote: Some(false),
                        min_id: Some(since),
                        ..Default::default()
                    })
                    .await?;
                Ok(SyncMessage::PullListResponse {
                    headers: records.iter().map(RecordHeader::of).collect(),
                })
            }
            SyncMessage::PullRecord { id } => {
                let record = self
                    .store
                    .get(id)
                    .await?
                    .filter(|r| r.state == RecordState::Loaded && !r.remote);
                Ok(SyncMessage::PullRecordResponse { record })
            }
            SyncMessage::PullFileChunk {
                owner,
                record_id,
                relative_path,
                offset,
                len,
            } => {
                if relative_path.contains("..") || relative_path.starts_with('/') {
                    return Err(SyncError::Protocol("invalid relative path".into()));
                }
                let record = self
                    .resolve_record(owner, record_id)
                    .await?
                    .ok_or_else(|| SyncError::Protocol(format!("unknown record {record_id}")))?;
                let path = self
                    .data_dir
                    .join(record.owner.to_string())
                    .join(record.id.to_string())
                    .join(&relative_path);

                let mut file = tokio::fs::File::open(&path).await?;
                let total = file.metadata().await?.len();
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let want = (len as u64).min(total.saturating_sub(offset)) as usize;
                let mut bytes = vec![0u8; want];
                file.read_exact(&mut bytes).await?;
                Ok(SyncMessage::FileChunk {
                    eof: offset + want as u64 >= total,
                    bytes,
                })
            }
            SyncMessage::PullDeviceIcon => {
                let path = self.data_dir.join("device-icon.png");
                let bytes = tokio::fs::read(&path).await.unwrap_or_default();
                Ok(SyncMessage::DeviceIcon { bytes })
            }
            SyncMessage::Tombstone {
                owner,
                record_id,
                deleted_at,
            } => {
                if let Some(record) = self.resolve_record(owner, record_id).await? {
                    // Last writer wins on the remote deletion timestamp.
                    if record.state != RecordState::Deleted && record.updated_at <= deleted_at {
                        self.store.mark_deleted(record.id).await?;
                        let _ = self
                            .tasks
                            .enqueue(TaskKind::DeleteRecord, Some(record.id), serde_json::json!({}))
                            .await;
                        debug!(record = record.id, "applied remote tombstone");
                    } else {
                        debug!(record = record.id, "remote tombstone lost LWW, ignoring");
                    }
                }
                Ok(SyncMessage::Ack)
            }
            SyncMessage::FlagUpdate {
                owner,
                record_id,
                favorite,
                updated_at,
            } => {
                if let Some(record) = self.resolve_record(owner, record_id).await? {
                    if record.state == RecordState::Loaded && record.updated_at < updated_at {
                        self.store
                            .update_flag(record.id, RecordFlag::Favorite, favorite)
                            .await?;
                        debug!(record = record.id, favorite, "applied remote flag update");
                    }
                }
                Ok(SyncMessage::Ack)
            }
            other => Err(SyncError::Protocol(format!(
                "unexpected request {other:?}"
            ))),
        }
    }

    async fn reachable_peer(&self, device: DeviceId) -> Result<PeerDevice, SyncError> {
        let peer = self
            .registry
            .get(device)
            .await
            .ok_or(SyncError::Untrusted(device))?;
        if peer.session_key.is_none() {
            return Err(SyncError::Untrusted(device));
        }
        Ok(peer)
    }
}

#[async_trait]
impl PeerClient for SyncManager {
    async fn push_record(&self, record: &PasteRecord) -> Result<(), SyncError> {
        let peers = self.registry.paired_peers().await;
        if peers.is_empty() {
            return Ok(());
        }

        // Every present stored file the record advertises must exist on
        // disk, or peer pulls would fail; the index is cached and
        // coalesced across the fan-out.
        let advertised: Vec<String> = record
            .stored_files()
            .into_iter()
            .filter(|f| f.present)
            .map(|f| f.relative_path.clone())
            .collect();
        if !advertised.is_empty() {
            let index = self
                .file_index
                .get(record.owner, record.id)
                .await
                .map_err(|e| SyncError::Protocol(format!("file index failed: {e}")))?;
            for path in &advertised {
                if !index.files.iter().any(|(name, _)| name == path) {
                    return Err(SyncError::Protocol(format!(
                        "payload file {path} missing from disk"
                    )));
                }
            }
        }

        let message = SyncMessage::Push {
            record: record.clone(),
        };
        let mut first_error = None;
        for peer in peers {
            if peer.endpoint.is_none() {
                debug!(peer = %peer.id, "skipping unreachable peer");
                continue;
            }
            match self.send_to_peer(&peer, &message).await {
                Ok(SyncMessage::Ack) => {}
                Ok(SyncMessage::Error { message }) => {
                    warn!(peer = %peer.id, "peer rejected push: {message}");
                    first_error.get_or_insert(SyncError::Protocol(message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(peer = %peer.id, "push failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        // Any failed peer fails the task so it retries; peers that
        // already ingested the record dedup the replay.
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn pull_file_chunk(
        &self,
        owner: DeviceId,
        record_id: RecordId,
        relative_path: &str,
        offset: u64,
        len: u32,
    ) -> Result<FileChunk, SyncError> {
        let peer = self.reachable_peer(owner).await?;
        let reply = self
            .send_to_peer(
                &peer,
                &SyncMessage::PullFileChunk {
                    owner,
                    record_id,
                    relative_path: relative_path.to_string(),
                    offset,
                    len,
                },
            )
            .await?;
        match reply {
            SyncMessage::FileChunk { bytes, eof } => Ok(FileChunk { bytes, eof }),
            SyncMessage::Error { message } => Err(SyncError::Protocol(message)),
            other => Err(SyncError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    async fn pull_device_icon(&self, device: DeviceId) -> Result<Vec<u8>, SyncError> {
        let peer = self.reachable_peer(device).await?;
        match self.send_to_peer(&peer, &SyncMessage::PullDeviceIcon).await? {
            SyncMessage::DeviceIcon { bytes } => Ok(bytes),
            SyncMessage::Error { message } => Err(SyncError::Protocol(message)),
            other => Err(SyncError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }
}

#[async_trait]
impl RequestHandler for SyncManager {
    async fn handle(&self, envelope: WireEnvelope) -> WireEnvelope {
        match envelope.kind {
            WireKind::PairingRequest => {
                let signed: SignedPairing = match serde_json::from_slice(&envelope.body) {
                    Ok(signed) => signed,
                    Err(e) => {
                        return WireEnvelope::error(self.device_id, format!("bad request: {e}"))
                    }
                };
                match self.pairing.handle_request(signed, None).await {
                    Ok(response) => match serde_json::to_vec(&response) {
                        Ok(body) => {
                            WireEnvelope::new(self.device_id, WireKind::PairingResponse, body)
                        }
                        Err(e) => WireEnvelope::error(self.device_id, e.to_string()),
                    },
                    Err(e) => WireEnvelope::error(self.device_id, e.to_string()),
                }
            }
            WireKind::Sync => {
                let Some(key) = self.registry.session_key_for(envelope.from).await else {
                    return WireEnvelope::error(self.device_id, "unverified peer");
                };
                let plain = match key.open(&envelope.body) {
                    Ok(plain) => plain,
                    Err(_) => {
                        // A paired peer sending undecryptable traffic has
                        // lost or rotated its keys; stop trusting it.
                        warn!(peer = %envelope.from, "undecryptable sync traffic, revoking trust");
                        let _ = self.registry.mark_untrusted(envelope.from).await;
                        return WireEnvelope::error(self.device_id, "decryption failed");
                    }
                };
                let message: SyncMessage = match serde_json::from_slice(&plain) {
                    Ok(message) => message,
                    Err(e) => {
                        return WireEnvelope::error(self.device_id, format!("bad message: {e}"))
                    }
                };
                let reply = self.dispatch(envelope.from, message).await;
                match serde_json::to_vec(&reply).map(|bytes| key.seal(&bytes)) {
                    Ok(Ok(sealed)) => WireEnvelope::new(self.device_id, WireKind::Sync, sealed),
                    _ => WireEnvelope::error(self.device_id, "failed to seal reply"),
                }
            }
            other => WireEnvelope::error(self.device_id, format!("unexpected kind {other:?}")),
        }
    }
}
