//! File-set content plugin
//!
//! A file-list slot carries newline-separated absolute paths. `build`
//! records stored-file metadata; the collection session copies the bytes
//! into the data directory and fills in size and hash.

use std::path::{Path, PathBuf};

use crate::clipboard::{FlavorSlot, FLAVOR_FILE_LIST};
use crate::record::{PasteItem, Payload, PayloadKind, StoredFile};

use super::{Blob, BlobSource, BuiltItem, ContentPlugin, PluginError};

pub struct FileSetPlugin;

impl ContentPlugin for FileSetPlugin {
    fn kind(&self) -> PayloadKind {
        PayloadKind::FileSet
    }

    fn claims(&self, flavor: &str) -> bool {
        flavor == FLAVOR_FILE_LIST
    }

    fn build(&self, slot: &FlavorSlot) -> Result<Option<BuiltItem>, PluginError> {
        let text = String::from_utf8(slot.data.clone())
            .map_err(|_| PluginError::Validation("file list is not valid UTF-8".into()))?;

        let paths: Vec<PathBuf> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect();
        if paths.is_empty() {
            return Ok(None);
        }

        let mut stored = Vec::with_capacity(paths.len());
        let mut blobs = Vec::with_capacity(paths.len());
        for (index, path) in paths.iter().enumerate() {
            if !path.is_absolute() {
                return Err(PluginError::Validation(format!(
                    "file list entry is not absolute: {}",
                    path.display()
                )));
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    PluginError::Validation(format!("unusable file name: {}", path.display()))
                })?;
            // Index prefix keeps same-named files from distinct
            // directories apart.
            let relative_path = format!("{index}-{name}");
            stored.push(StoredFile {
                relative_path: relative_path.clone(),
                size: 0,
                hash: String::new(),
                present: false,
            });
            blobs.push(Blob {
                relative_path,
                source: BlobSource::LocalFile(path.clone()),
            });
        }

        Ok(Some(BuiltItem {
            item: PasteItem::new(Payload::FileSet(stored), vec![slot.flavor.clone()]),
            blobs,
        }))
    }

    fn render(&self, item: &PasteItem, record_dir: &Path) -> Option<FlavorSlot> {
        let files = match &item.payload {
            Payload::FileSet(files) => files,
            _ => return None,
        };
        let present: Vec<String> = files
            .iter()
            .filter(|f| f.present)
            .map(|f| record_dir.join(&f.relative_path).display().to_string())
            .collect();
        if present.is_empty() {
            return None;
        }
        Some(FlavorSlot::new(
            FLAVOR_FILE_LIST,
            present.join("\n").into_bytes(),
        ))
    }
}
