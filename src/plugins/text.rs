//! Plain-text content plugin

use std::path::Path;

use crate::clipboard::{FlavorSlot, FLAVOR_TEXT};
use crate::record::{PasteItem, Payload, PayloadKind};

use super::{BuiltItem, ContentPlugin, PluginError};

pub struct TextPlugin;

impl ContentPlugin for TextPlugin {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn claims(&self, flavor: &str) -> bool {
        flavor == FLAVOR_TEXT
    }

    fn build(&self, slot: &FlavorSlot) -> Result<Option<BuiltItem>, PluginError> {
        let text = String::from_utf8(slot.data.clone())
            .map_err(|_| PluginError::Validation("text slot is not valid UTF-8".into()))?;
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(BuiltItem::inline(PasteItem::new(
            Payload::Text(text),
            vec![slot.flavor.clone()],
        ))))
    }

    fn render(&self, item: &PasteItem, _record_dir: &Path) -> Option<FlavorSlot> {
        match &item.payload {
            Payload::Text(text) => Some(FlavorSlot::text(text.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_text_item() {
        let built = TextPlugin
            .build(&FlavorSlot::text("hello"))
            .unwrap()
            .unwrap();
        assert_eq!(built.item.kind(), PayloadKind::Text);
        assert_eq!(built.item.size, 5);
        assert!(built.blobs.is_empty());
    }

    #[test]
    fn rejects_invalid_utf8() {
        let slot = FlavorSlot::new(FLAVOR_TEXT, vec![0xff, 0xfe]);
        assert!(matches!(
            TextPlugin.build(&slot),
            Err(PluginError::Validation(_))
        ));
    }

    #[test]
    fn empty_text_is_skipped() {
        let slot = FlavorSlot::new(FLAVOR_TEXT, Vec::new());
        assert!(TextPlugin.build(&slot).unwrap().is_none());
    }
}
