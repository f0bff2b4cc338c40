//! Core data model for captured clipboard records
//!
//! A [`PasteRecord`] is one capture episode: an ordered list of typed
//! [`PasteItem`]s plus lifecycle metadata. Records move through a small
//! state machine (`Loading -> Loaded -> Deleted`) and are identified
//! globally by `(owner, id)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Store-assigned, monotonically increasing record identifier.
pub type RecordId = i64;

/// Stable identifier of one running instance.
pub type DeviceId = Uuid;

/// Lifecycle state of a record.
///
/// `Loading -> Loaded` happens at most once; a record that fails item
/// materialization goes `Loading -> Deleted` instead. `Deleted` is a
/// tombstone and is terminal except for purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Loading,
    Loaded,
    Deleted,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Loading => "loading",
            RecordState::Loaded => "loaded",
            RecordState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "loading" => Some(RecordState::Loading),
            "loaded" => Some(RecordState::Loaded),
            "deleted" => Some(RecordState::Deleted),
            _ => None,
        }
    }
}

/// An RGBA color parsed from clipboard text (e.g. `#ff8800`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbaColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl RgbaColor {
    pub fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub fn to_hex(&self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

/// A file referenced by an image-set or file-set item.
///
/// Payload bytes live on disk under the data directory at
/// `<owner>/<record>/<relative_path>`. For records received from a peer,
/// `present` stays false until the pull-file task has materialized the
/// bytes locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub relative_path: String,
    pub size: u64,
    pub hash: String,
    pub present: bool,
}

/// Typed payload of one clipboard item. This is a closed set: collection,
/// post-processing and native re-serialization all exhaustively match on
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    Text(String),
    Url(String),
    Color(RgbaColor),
    Html(String),
    Rtf(Vec<u8>),
    ImageSet(Vec<StoredFile>),
    FileSet(Vec<StoredFile>),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Text(_) => PayloadKind::Text,
            Payload::Url(_) => PayloadKind::Url,
            Payload::Color(_) => PayloadKind::Color,
            Payload::Html(_) => PayloadKind::Html,
            Payload::Rtf(_) => PayloadKind::Rtf,
            Payload::ImageSet(_) => PayloadKind::ImageSet,
            Payload::FileSet(_) => PayloadKind::FileSet,
        }
    }

    /// Canonical bytes used for hashing and size accounting.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Text(s) | Payload::Url(s) | Payload::Html(s) => s.as_bytes().to_vec(),
            Payload::Color(c) => c.to_hex().into_bytes(),
            Payload::Rtf(b) => b.clone(),
            Payload::ImageSet(files) | Payload::FileSet(files) => {
                let mut out = Vec::new();
                for f in files {
                    out.extend_from_slice(f.relative_path.as_bytes());
                    out.push(0);
                    out.extend_from_slice(f.hash.as_bytes());
                    out.push(0);
                }
                out
            }
        }
    }

    pub fn stored_files(&self) -> Option<&[StoredFile]> {
        match self {
            Payload::ImageSet(files) | Payload::FileSet(files) => Some(files),
            _ => None,
        }
    }

    pub fn stored_files_mut(&mut self) -> Option<&mut Vec<StoredFile>> {
        match self {
            Payload::ImageSet(files) | Payload::FileSet(files) => Some(files),
            _ => None,
        }
    }
}

/// Fieldless discriminant of [`Payload`], used for plugin dispatch and
/// item ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    Text,
    Url,
    Color,
    Html,
    Rtf,
    ImageSet,
    FileSet,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 7] = [
        PayloadKind::FileSet,
        PayloadKind::ImageSet,
        PayloadKind::Html,
        PayloadKind::Rtf,
        PayloadKind::Url,
        PayloadKind::Color,
        PayloadKind::Text,
    ];

    /// Display priority. Lower sorts first; `items[0]` after the
    /// post-process sort is the primary preview item, and the write path
    /// renders items in the same order.
    pub fn priority(&self) -> u8 {
        match self {
            PayloadKind::FileSet => 0,
            PayloadKind::ImageSet => 1,
            PayloadKind::Html => 2,
            PayloadKind::Rtf => 3,
            PayloadKind::Url => 4,
            PayloadKind::Color => 5,
            PayloadKind::Text => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Text => "text",
            PayloadKind::Url => "url",
            PayloadKind::Color => "color",
            PayloadKind::Html => "html",
            PayloadKind::Rtf => "rtf",
            PayloadKind::ImageSet => "image-set",
            PayloadKind::FileSet => "file-set",
        }
    }
}

/// One typed clipboard item, exclusively owned by one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasteItem {
    pub payload: Payload,
    /// Native flavor identifiers this item was built from.
    pub flavors: Vec<String>,
    pub size: u64,
    pub hash: String,
}

impl PasteItem {
    pub fn new(payload: Payload, flavors: Vec<String>) -> Self {
        let bytes = payload.canonical_bytes();
        let size = bytes.len() as u64;
        let hash = hex_sha256(&bytes);
        Self {
            payload,
            flavors,
            size,
            hash,
        }
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    /// Recompute size and hash after the payload was mutated in place
    /// (e.g. stored-file metadata filled in during materialization).
    pub fn refresh_summary(&mut self) {
        let bytes = self.payload.canonical_bytes();
        self.size = bytes.len() as u64;
        self.hash = hex_sha256(&bytes);
    }
}

/// One capture episode with lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasteRecord {
    pub id: RecordId,
    pub owner: DeviceId,
    /// The id the owning instance assigned. `None` for locally captured
    /// records; set on ingested remote records so file pulls and
    /// tombstones can reference the owner's identity `(owner, origin_id)`.
    pub origin_id: Option<RecordId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub hash: String,
    pub size: u64,
    pub source_app: Option<String>,
    pub favorite: bool,
    pub state: RecordState,
    pub remote: bool,
    pub items: Vec<PasteItem>,
    pub tags: Vec<String>,
}

impl PasteRecord {
    /// New unsaved placeholder. The store assigns `id`.
    pub fn placeholder(owner: DeviceId, source_app: Option<String>, remote: bool) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            owner,
            origin_id: None,
            created_at: now,
            updated_at: now,
            hash: String::new(),
            size: 0,
            source_app,
            favorite: false,
            state: RecordState::Loading,
            remote,
            items: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Recompute record hash and size from the current item list.
    ///
    /// `(hash, size)` identify byte-identical content for dedup, so the
    /// hash covers item payload hashes in item order.
    pub fn refresh_summary(&mut self) {
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        for item in &self.items {
            hasher.update(item.hash.as_bytes());
            size += item.size;
        }
        self.hash = hex::encode(hasher.finalize());
        self.size = size;
    }

    /// The primary preview item, deterministic after the post-process
    /// priority sort.
    pub fn primary_item(&self) -> Option<&PasteItem> {
        self.items.first()
    }

    pub fn item_of_kind(&self, kind: PayloadKind) -> Option<&PasteItem> {
        self.items.iter().find(|i| i.kind() == kind)
    }

    pub fn has_kind(&self, kind: PayloadKind) -> bool {
        self.item_of_kind(kind).is_some()
    }

    /// All stored files referenced by image-set/file-set items.
    pub fn stored_files(&self) -> Vec<&StoredFile> {
        self.items
            .iter()
            .filter_map(|i| i.payload.stored_files())
            .flatten()
            .collect()
    }
}

/// Events emitted when a record changes visibility, consumed by the sync
/// manager.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    Loaded(PasteRecord),
    Deleted {
        owner: DeviceId,
        record_id: RecordId,
        deleted_at: DateTime<Utc>,
    },
    FlagChanged {
        owner: DeviceId,
        record_id: RecordId,
        favorite: bool,
        updated_at: DateTime<Utc>,
    },
}

pub fn hex_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn item_summary_tracks_payload() {
        let item = PasteItem::new(Payload::Text("hello".into()), vec!["text/plain".into()]);
        assert_eq!(item.size, 5);
        assert_eq!(item.hash, hex_sha256(b"hello"));
        assert_eq!(item.kind(), PayloadKind::Text);
    }

    #[test]
    fn record_summary_is_order_sensitive() {
        let owner = Uuid::new_v4();
        let mut a = PasteRecord::placeholder(owner, None, false);
        a.items = vec![
            PasteItem::new(Payload::Text("one".into()), vec![]),
            PasteItem::new(Payload::Url("https://example.com".into()), vec![]),
        ];
        a.refresh_summary();

        let mut b = PasteRecord::placeholder(owner, None, false);
        b.items = a.items.iter().rev().cloned().collect();
        b.refresh_summary();

        assert_eq!(a.size, b.size);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn identical_payloads_hash_identically() {
        let owner = Uuid::new_v4();
        let mut a = PasteRecord::placeholder(owner, None, false);
        a.items = vec![PasteItem::new(Payload::Text("same".into()), vec![])];
        a.refresh_summary();

        let mut b = PasteRecord::placeholder(owner, Some("Other.app".into()), true);
        b.items = vec![PasteItem::new(Payload::Text("same".into()), vec![])];
        b.refresh_summary();

        assert_eq!((a.hash, a.size), (b.hash, b.size));
    }

    #[test]
    fn color_round_trip() {
        let c = RgbaColor::opaque(255, 136, 0);
        assert_eq!(c.to_hex(), "#ff8800");
    }

    #[test]
    fn state_parse_round_trip() {
        for state in [RecordState::Loading, RecordState::Loaded, RecordState::Deleted] {
            assert_eq!(RecordState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RecordState::parse("bogus"), None);
    }
}
