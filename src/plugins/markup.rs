//! Markup content plugins (HTML and RTF)

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::clipboard::{FlavorSlot, FLAVOR_HTML, FLAVOR_RTF};
use crate::record::{PasteItem, Payload, PayloadKind};

use super::{BuiltItem, ContentPlugin, PluginError};

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("static regex"));
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Strip tags and collapse whitespace, for comparing markup against an
/// accompanying plain-text item.
pub fn html_to_text(html: &str) -> String {
    let stripped = TAG_RE.replace_all(html, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    WS_RE.replace_all(decoded.trim(), " ").into_owned()
}

pub struct HtmlPlugin;

impl ContentPlugin for HtmlPlugin {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Html
    }

    fn claims(&self, flavor: &str) -> bool {
        flavor == FLAVOR_HTML
    }

    fn build(&self, slot: &FlavorSlot) -> Result<Option<BuiltItem>, PluginError> {
        let html = String::from_utf8(slot.data.clone())
            .map_err(|_| PluginError::Validation("html slot is not valid UTF-8".into()))?;
        if html.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(BuiltItem::inline(PasteItem::new(
            Payload::Html(html),
            vec![slot.flavor.clone()],
        ))))
    }

    fn render(&self, item: &PasteItem, _record_dir: &Path) -> Option<FlavorSlot> {
        match &item.payload {
            Payload::Html(html) => Some(FlavorSlot::new(FLAVOR_HTML, html.clone().into_bytes())),
            _ => None,
        }
    }
}

pub struct RtfPlugin;

impl ContentPlugin for RtfPlugin {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Rtf
    }

    fn claims(&self, flavor: &str) -> bool {
        flavor == FLAVOR_RTF
    }

    fn build(&self, slot: &FlavorSlot) -> Result<Option<BuiltItem>, PluginError> {
        if slot.data.is_empty() {
            return Ok(None);
        }
        // RTF streams begin with the {\rtf control group.
        if !slot.data.starts_with(b"{\\rtf") {
            return Err(PluginError::Validation("rtf slot missing {\\rtf header".into()));
        }
        Ok(Some(BuiltItem::inline(PasteItem::new(
            Payload::Rtf(slot.data.clone()),
            vec![slot.flavor.clone()],
        ))))
    }

    fn render(&self, item: &PasteItem, _record_dir: &Path) -> Option<FlavorSlot> {
        match &item.payload {
            Payload::Rtf(bytes) => Some(FlavorSlot::new(FLAVOR_RTF, bytes.clone())),
            _ => None,
        }
    }
}
