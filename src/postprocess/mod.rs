//! Post-process plugin chain
//!
//! Runs after raw collection and before a record becomes visible. Each
//! processor may add, remove or transform items but never changes record
//! identity. The chain order is fixed at startup; a processor can also
//! discard the whole record (dedup), which makes the session delete the
//! placeholder instead of finalizing it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::plugins::{color::parse_color, markup::html_to_text, url::parse_url};
use crate::record::{PasteItem, PasteRecord, Payload, PayloadKind};
use crate::store::{PasteStore, RecordQuery, StoreError};

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("processor {0} changed record identity")]
    IdentityChanged(&'static str),
}

pub struct PostContext {
    pub store: Arc<dyn PasteStore>,
    /// How many recent records participate in content dedup.
    pub dedup_window: usize,
}

/// Outcome of one processor (and of the whole chain).
#[derive(Debug, PartialEq, Eq)]
pub enum PostAction {
    Continue,
    /// Drop the record; the session deletes the placeholder.
    Discard(String),
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(
        &self,
        ctx: &PostContext,
        record: &mut PasteRecord,
    ) -> Result<PostAction, PostProcessError>;
}

/// Ordered processor chain built once at startup.
pub struct PostProcessChain {
    processors: Vec<Box<dyn PostProcessor>>,
}

impl PostProcessChain {
    /// The stock chain: validate, dedup, derive url/color, strip
    /// redundant markup, priority sort.
    pub fn stock() -> Self {
        Self {
            processors: vec![
                Box::new(ValidateItems),
                Box::new(Dedup),
                Box::new(DeriveUrl),
                Box::new(DeriveColor),
                Box::new(StripRedundantMarkup),
                Box::new(SortByPriority),
            ],
        }
    }

    pub fn empty() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    /// Run every processor in order. Stops at the first discard. The
    /// record summary is refreshed afterwards so finalize persists the
    /// transformed item list.
    pub async fn run(
        &self,
        ctx: &PostContext,
        record: &mut PasteRecord,
    ) -> Result<PostAction, PostProcessError> {
        for processor in &self.processors {
            let identity = (record.id, record.owner);
            match processor.process(ctx, record).await? {
                PostAction::Continue => {}
                PostAction::Discard(reason) => {
                    debug!(record = record.id, processor = processor.name(), %reason, "record discarded");
                    return Ok(PostAction::Discard(reason));
                }
            }
            if identity != (record.id, record.owner) {
                return Err(PostProcessError::IdentityChanged(processor.name()));
            }
        }
        record.refresh_summary();
        Ok(PostAction::Continue)
    }
}

/// Drops items that fail basic payload validation.
pub struct ValidateItems;

#[async_trait]
impl PostProcessor for ValidateItems {
    fn name(&self) -> &'static str {
        "validate-items"
    }

    async fn process(
        &self,
        _ctx: &PostContext,
        record: &mut PasteRecord,
    ) -> Result<PostAction, PostProcessError> {
        record.items.retain(|item| match &item.payload {
            Payload::Text(s) | Payload::Html(s) => !s.is_empty(),
            Payload::Url(u) => parse_url(u).is_some(),
            Payload::Color(_) => true,
            Payload::Rtf(b) => !b.is_empty(),
            Payload::ImageSet(files) | Payload::FileSet(files) => {
                !files.is_empty() && files.iter().all(|f| !f.relative_path.is_empty())
            }
        });
        Ok(PostAction::Continue)
    }
}

/// Discards a record whose `(hash, size)` matches another record inside
/// the recent comparison window. Remote and local records share the
/// window, so a replayed inbound push is a no-op.
pub struct Dedup;

#[async_trait]
impl PostProcessor for Dedup {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn process(
        &self,
        ctx: &PostContext,
        record: &mut PasteRecord,
    ) -> Result<PostAction, PostProcessError> {
        if record.hash.is_empty() {
            record.refresh_summary();
        }
        let window = ctx
            .store
            .query(&RecordQuery::recent_window(ctx.dedup_window))
            .await?;
        for other in window {
            if other.id != record.id && other.hash == record.hash && other.size == record.size {
                return Ok(PostAction::Discard(format!(
                    "duplicate of record {}",
                    other.id
                )));
            }
        }
        Ok(PostAction::Continue)
    }
}

/// Adds a URL item when a text item is exactly one link.
pub struct DeriveUrl;

#[async_trait]
impl PostProcessor for DeriveUrl {
    fn name(&self) -> &'static str {
        "derive-url"
    }

    async fn process(
        &self,
        _ctx: &PostContext,
        record: &mut PasteRecord,
    ) -> Result<PostAction, PostProcessError> {
        if record.has_kind(PayloadKind::Url) {
            return Ok(PostAction::Continue);
        }
        let derived = record.item_of_kind(PayloadKind::Text).and_then(|item| {
            match &item.payload {
                Payload::Text(text) => parse_url(text).map(|url| (url, item.flavors.clone())),
                _ => None,
            }
        });
        if let Some((url, flavors)) = derived {
            record.items.push(PasteItem::new(Payload::Url(url), flavors));
        }
        Ok(PostAction::Continue)
    }
}

/// Adds a color item when a text item is a color literal.
pub struct DeriveColor;

#[async_trait]
impl PostProcessor for DeriveColor {
    fn name(&self) -> &'static str {
        "derive-color"
    }

    async fn process(
        &self,
        _ctx: &PostContext,
        record: &mut PasteRecord,
    ) -> Result<PostAction, PostProcessError> {
        if record.has_kind(PayloadKind::Color) {
            return Ok(PostAction::Continue);
        }
        let derived = record.item_of_kind(PayloadKind::Text).and_then(|item| {
            match &item.payload {
                Payload::Text(text) => parse_color(text).map(|c| (c, item.flavors.clone())),
                _ => None,
            }
        });
        if let Some((color, flavors)) = derived {
            record
                .items
                .push(PasteItem::new(Payload::Color(color), flavors));
        }
        Ok(PostAction::Continue)
    }
}

/// Drops markup items that merely restate an already-present plain-text
/// item.
pub struct StripRedundantMarkup;

#[async_trait]
impl PostProcessor for StripRedundantMarkup {
    fn name(&self) -> &'static str {
        "strip-redundant-markup"
    }

    async fn process(
        &self,
        _ctx: &PostContext,
        record: &mut PasteRecord,
    ) -> Result<PostAction, PostProcessError> {
        let plain = match record.item_of_kind(PayloadKind::Text) {
            Some(item) => match &item.payload {
                Payload::Text(text) => normalize_ws(text),
                _ => return Ok(PostAction::Continue),
            },
            None => return Ok(PostAction::Continue),
        };

        record.items.retain(|item| match &item.payload {
            Payload::Html(html) => html_to_text(html) != plain,
            _ => true,
        });
        Ok(PostAction::Continue)
    }
}

/// Stable-sorts items by declared kind priority so the primary preview
/// item is deterministic.
pub struct SortByPriority;

#[async_trait]
impl PostProcessor for SortByPriority {
    fn name(&self) -> &'static str {
        "sort-by-priority"
    }

    async fn process(
        &self,
        _ctx: &PostContext,
        record: &mut PasteRecord,
    ) -> Result<PostAction, PostProcessError> {
        record.items.sort_by_key(|item| item.kind().priority());
        Ok(PostAction::Continue)
    }
}

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
