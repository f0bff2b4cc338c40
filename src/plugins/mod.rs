//! Typed-content plugins
//!
//! One plugin per payload category. A plugin claims native flavor
//! identifiers, builds a [`PasteItem`] from a flavor slot, and can render
//! an item back into a writable native representation. The set is closed;
//! the registry is an explicit struct built once at startup.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::clipboard::{FlavorSlot, FLAVOR_ORIGIN_MARKER};
use crate::record::{DeviceId, PasteItem, PasteRecord, PayloadKind};

pub mod color;
pub mod file;
pub mod image;
pub mod markup;
pub mod text;
pub mod url;

pub use color::ColorPlugin;
pub use file::FileSetPlugin;
pub use image::ImageSetPlugin;
pub use markup::{HtmlPlugin, RtfPlugin};
pub use text::TextPlugin;
pub use url::UrlPlugin;

#[derive(Debug, Error)]
pub enum PluginError {
    /// Unrecognized or corrupt flavor data. The slot is dropped and the
    /// collection session continues.
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Where a stored file's bytes come from during materialization.
#[derive(Debug, Clone)]
pub enum BlobSource {
    /// Bytes captured in memory (images).
    Bytes(Vec<u8>),
    /// Copy from a local path (file lists).
    LocalFile(PathBuf),
    /// Bytes live on the owning peer; a pull-file task fetches them.
    Remote,
}

/// A pending payload file produced by `build`.
#[derive(Debug, Clone)]
pub struct Blob {
    pub relative_path: String,
    pub source: BlobSource,
}

/// A built item plus the payload files the collection session must
/// materialize before the record completes.
#[derive(Debug, Clone)]
pub struct BuiltItem {
    pub item: PasteItem,
    pub blobs: Vec<Blob>,
}

impl BuiltItem {
    pub fn inline(item: PasteItem) -> Self {
        Self {
            item,
            blobs: Vec::new(),
        }
    }
}

pub trait ContentPlugin: Send + Sync {
    fn kind(&self) -> PayloadKind;

    /// Whether this plugin handles the given native flavor.
    fn claims(&self, flavor: &str) -> bool;

    /// Build an item from one flavor slot. `Ok(None)` means the slot is
    /// valid but empty and should be skipped silently.
    fn build(&self, slot: &FlavorSlot) -> Result<Option<BuiltItem>, PluginError>;

    /// Render a writable native representation of an item, if one
    /// exists. `record_dir` holds the record's payload files.
    fn render(&self, item: &PasteItem, record_dir: &Path) -> Option<FlavorSlot>;
}

/// Fixed plugin set, registration order = claim precedence.
pub struct PluginRegistry {
    plugins: Vec<Box<dyn ContentPlugin>>,
}

impl PluginRegistry {
    /// The stock plugin set.
    pub fn stock() -> Self {
        Self {
            plugins: vec![
                Box::new(FileSetPlugin),
                Box::new(ImageSetPlugin),
                Box::new(HtmlPlugin),
                Box::new(RtfPlugin),
                Box::new(UrlPlugin),
                Box::new(ColorPlugin),
                Box::new(TextPlugin),
            ],
        }
    }

    /// First-registered plugin claiming `flavor`.
    pub fn plugin_for_flavor(&self, flavor: &str) -> Option<&dyn ContentPlugin> {
        self.plugins
            .iter()
            .find(|p| p.claims(flavor))
            .map(|p| p.as_ref())
    }

    pub fn plugin_for_kind(&self, kind: PayloadKind) -> Option<&dyn ContentPlugin> {
        self.plugins
            .iter()
            .find(|p| p.kind() == kind)
            .map(|p| p.as_ref())
    }

    /// Render a record back into native flavor slots, items in their
    /// stored (priority) order so the primary item lands first, plus the
    /// origin marker identifying this instance's own writes.
    pub fn render_record(
        &self,
        record: &PasteRecord,
        record_dir: &Path,
        device: DeviceId,
    ) -> Vec<FlavorSlot> {
        let mut slots = Vec::new();
        for item in &record.items {
            if let Some(plugin) = self.plugin_for_kind(item.kind()) {
                if let Some(slot) = plugin.render(item, record_dir) {
                    slots.push(slot);
                }
            }
        }
        slots.push(FlavorSlot::new(
            FLAVOR_ORIGIN_MARKER,
            device.to_string().into_bytes(),
        ));
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{FLAVOR_HTML, FLAVOR_PNG, FLAVOR_TEXT};

    #[test]
    fn stock_registry_claims_known_flavors() {
        let registry = PluginRegistry::stock();
        assert_eq!(
            registry.plugin_for_flavor(FLAVOR_TEXT).unwrap().kind(),
            PayloadKind::Text
        );
        assert_eq!(
            registry.plugin_for_flavor(FLAVOR_HTML).unwrap().kind(),
            PayloadKind::Html
        );
        assert_eq!(
            registry.plugin_for_flavor(FLAVOR_PNG).unwrap().kind(),
            PayloadKind::ImageSet
        );
        assert!(registry.plugin_for_flavor("application/x-unknown").is_none());
    }

    #[test]
    fn render_record_appends_origin_marker() {
        let registry = PluginRegistry::stock();
        let device = uuid::Uuid::new_v4();
        let mut record = PasteRecord::placeholder(device, None, false);
        record.items = vec![PasteItem::new(
            crate::record::Payload::Text("hi".into()),
            vec![FLAVOR_TEXT.to_string()],
        )];

        let slots = registry.render_record(&record, Path::new("/nonexistent"), device);
        assert_eq!(slots.last().unwrap().flavor, FLAVOR_ORIGIN_MARKER);
        assert_eq!(slots[0].flavor, FLAVOR_TEXT);
    }
}
