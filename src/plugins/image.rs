//! Image-set content plugin
//!
//! Image bytes are not held inline in the record; `build` emits stored-
//! file metadata plus a blob the collection session writes to the data
//! directory.

use std::path::Path;

use crate::clipboard::{FlavorSlot, FLAVOR_PNG, FLAVOR_RGBA};
use crate::record::{hex_sha256, PasteItem, Payload, PayloadKind, StoredFile};

use super::{Blob, BlobSource, BuiltItem, ContentPlugin, PluginError};

const FLAVOR_TIFF: &str = "image/tiff";
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

pub struct ImageSetPlugin;

impl ImageSetPlugin {
    fn file_name_for(flavor: &str) -> &'static str {
        match flavor {
            FLAVOR_PNG => "image-0.png",
            FLAVOR_TIFF => "image-0.tiff",
            _ => "image-0.rgba",
        }
    }

    fn validate(flavor: &str, data: &[u8]) -> Result<(), PluginError> {
        match flavor {
            FLAVOR_PNG => {
                if !data.starts_with(PNG_MAGIC) {
                    return Err(PluginError::Validation("png slot missing magic bytes".into()));
                }
            }
            FLAVOR_RGBA => {
                if data.len() <= 8 {
                    return Err(PluginError::Validation("rgba slot missing header".into()));
                }
                let width = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
                let height = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
                if width == 0 || height == 0 || data.len() - 8 != width * height * 4 {
                    return Err(PluginError::Validation(format!(
                        "rgba slot dimensions {}x{} do not match {} payload bytes",
                        width,
                        height,
                        data.len() - 8
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl ContentPlugin for ImageSetPlugin {
    fn kind(&self) -> PayloadKind {
        PayloadKind::ImageSet
    }

    fn claims(&self, flavor: &str) -> bool {
        matches!(flavor, FLAVOR_PNG | FLAVOR_RGBA | FLAVOR_TIFF)
    }

    fn build(&self, slot: &FlavorSlot) -> Result<Option<BuiltItem>, PluginError> {
        if slot.data.is_empty() {
            return Ok(None);
        }
        Self::validate(&slot.flavor, &slot.data)?;

        let relative_path = Self::file_name_for(&slot.flavor).to_string();
        let stored = StoredFile {
            relative_path: relative_path.clone(),
            size: slot.data.len() as u64,
            hash: hex_sha256(&slot.data),
            present: false,
        };
        Ok(Some(BuiltItem {
            item: PasteItem::new(Payload::ImageSet(vec![stored]), vec![slot.flavor.clone()]),
            blobs: vec![Blob {
                relative_path,
                source: BlobSource::Bytes(slot.data.clone()),
            }],
        }))
    }

    fn render(&self, item: &PasteItem, record_dir: &Path) -> Option<FlavorSlot> {
        let files = match &item.payload {
            Payload::ImageSet(files) => files,
            _ => return None,
        };
        let first = files.iter().find(|f| f.present)?;
        let bytes = std::fs::read(record_dir.join(&first.relative_path)).ok()?;
        let flavor = if first.relative_path.ends_with(".png") {
            FLAVOR_PNG
        } else {
            FLAVOR_RGBA
        };
        Some(FlavorSlot::new(flavor, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba_slot(width: u32, height: u32) -> FlavorSlot {
        let mut data = Vec::new();
        data.extend_from_slice(&width.to_le_bytes());
        data.extend_from_slice(&height.to_le_bytes());
        data.extend(std::iter::repeat(0u8).take((width * height * 4) as usize));
        FlavorSlot::new(FLAVOR_RGBA, data)
    }

    #[test]
    fn builds_rgba_image() {
        let built = ImageSetPlugin.build(&rgba_slot(2, 2)).unwrap().unwrap();
        assert_eq!(built.item.kind(), PayloadKind::ImageSet);
        assert_eq!(built.blobs.len(), 1);
        match &built.item.payload {
            Payload::ImageSet(files) => {
                assert!(!files[0].present);
                assert_eq!(files[0].size, 8 + 16);
            }
            _ => panic!("expected image set"),
        }
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let mut slot = rgba_slot(2, 2);
        slot.data.truncate(12);
        assert!(ImageSetPlugin.build(&slot).is_err());
    }

    #[test]
    fn rejects_bad_png() {
        let slot = FlavorSlot::new(FLAVOR_PNG, b"not a png".to_vec());
        assert!(ImageSetPlugin.build(&slot).is_err());
    }
}
