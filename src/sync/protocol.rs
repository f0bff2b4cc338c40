//! Sync wire messages
//!
//! These travel as AES-GCM ciphertext inside a `WireKind::Sync`
//! envelope. Bulk file bytes never ride along with a pushed record;
//! peers pull them lazily with chunked range requests keyed by
//! `(owner, record id, relative path)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{DeviceId, PasteRecord, RecordId, RecordState};

/// Chunk size for file pulls.
pub const FILE_CHUNK_LEN: u32 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data")]
pub enum SyncMessage {
    /// A newly loaded record, stored-file metadata only.
    Push { record: PasteRecord },

    /// List record headers with id >= since.
    PullList { since: RecordId },
    PullListResponse { headers: Vec<RecordHeader> },

    /// Fetch one full record (metadata, no bulk bytes).
    PullRecord { id: RecordId },
    PullRecordResponse { record: Option<PasteRecord> },

    /// Range request into a stored payload file.
    PullFileChunk {
        owner: DeviceId,
        record_id: RecordId,
        relative_path: String,
        offset: u64,
        len: u32,
    },
    FileChunk { bytes: Vec<u8>, eof: bool },

    PullDeviceIcon,
    DeviceIcon { bytes: Vec<u8> },

    /// Deletion propagation; applied last-writer-wins on `deleted_at`.
    Tombstone {
        owner: DeviceId,
        record_id: RecordId,
        deleted_at: DateTime<Utc>,
    },

    /// Favorite-flag propagation; last-writer-wins on `updated_at`.
    FlagUpdate {
        owner: DeviceId,
        record_id: RecordId,
        favorite: bool,
        updated_at: DateTime<Utc>,
    },

    Ack,
    Error { message: String },
}

/// Compact record listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub id: RecordId,
    pub owner: DeviceId,
    pub hash: String,
    pub size: u64,
    pub state: RecordState,
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
}

impl RecordHeader {
    pub fn of(record: &PasteRecord) -> Self {
        Self {
            id: record.id,
            owner: record.owner,
            hash: record.hash.clone(),
            size: record.size,
            state: record.state,
            favorite: record.favorite,
            created_at: record.created_at,
        }
    }
}
