//! URL content plugin
//!
//! Claims `text/uri-list` slots directly; the post-process chain also
//! uses [`parse_url`] to derive a URL item from a plain-text item that
//! is exactly one link.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::clipboard::{FlavorSlot, FLAVOR_TEXT};
use crate::record::{PasteItem, Payload, PayloadKind};

use super::{BuiltItem, ContentPlugin, PluginError};

pub const FLAVOR_URI_LIST: &str = "text/uri-list";

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:https?|ftp|file)://[^\s]+$").expect("static regex")
});

/// Parse text that consists of exactly one URL.
pub fn parse_url(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if URL_RE.is_match(trimmed) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

pub struct UrlPlugin;

impl ContentPlugin for UrlPlugin {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Url
    }

    fn claims(&self, flavor: &str) -> bool {
        flavor == FLAVOR_URI_LIST
    }

    fn build(&self, slot: &FlavorSlot) -> Result<Option<BuiltItem>, PluginError> {
        let text = String::from_utf8(slot.data.clone())
            .map_err(|_| PluginError::Validation("uri-list slot is not valid UTF-8".into()))?;

        // RFC 2483: one URI per line, lines starting with '#' are comments.
        let first = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'));

        match first {
            None => Ok(None),
            Some(candidate) => {
                let url = parse_url(candidate).ok_or_else(|| {
                    PluginError::Validation(format!("not a supported URL: {candidate}"))
                })?;
                Ok(Some(BuiltItem::inline(PasteItem::new(
                    Payload::Url(url),
                    vec![slot.flavor.clone()],
                ))))
            }
        }
    }

    fn render(&self, item: &PasteItem, _record_dir: &Path) -> Option<FlavorSlot> {
        match &item.payload {
            Payload::Url(url) => Some(FlavorSlot::new(FLAVOR_TEXT, url.clone().into_bytes())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_url() {
        assert_eq!(
            parse_url("  https://example.com/a?b=c  "),
            Some("https://example.com/a?b=c".to_string())
        );
        assert_eq!(parse_url("not a url"), None);
        assert_eq!(parse_url("https://a.com and more"), None);
    }

    #[test]
    fn builds_from_uri_list() {
        let slot = FlavorSlot::new(
            FLAVOR_URI_LIST,
            b"# comment\nhttps://example.com\n".to_vec(),
        );
        let built = UrlPlugin.build(&slot).unwrap().unwrap();
        assert_eq!(
            built.item.payload,
            Payload::Url("https://example.com".into())
        );
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let slot = FlavorSlot::new(FLAVOR_URI_LIST, b"javascript:alert(1)".to_vec());
        assert!(UrlPlugin.build(&slot).is_err());
    }
}
