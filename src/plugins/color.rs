//! Color content plugin
//!
//! Colors have no native clipboard flavor of their own; the post-process
//! chain derives them from text items via [`parse_color`]. The plugin
//! exists so color items can be rendered back as text.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::clipboard::{FlavorSlot, FLAVOR_TEXT};
use crate::record::{PasteItem, Payload, PayloadKind, RgbaColor};

use super::{BuiltItem, ContentPlugin, PluginError};

static HEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#([0-9a-fA-F]{3}|[0-9a-fA-F]{6}|[0-9a-fA-F]{8})$").expect("static regex"));

static RGB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^rgb\(\s*(\d{1,3})\s*,\s*(\d{1,3})\s*,\s*(\d{1,3})\s*\)$").expect("static regex")
});

/// Parse a color literal: `#rgb`, `#rrggbb`, `#rrggbbaa` or `rgb(r,g,b)`.
pub fn parse_color(text: &str) -> Option<RgbaColor> {
    let trimmed = text.trim();

    if let Some(caps) = HEX_RE.captures(trimmed) {
        let digits = &caps[1];
        return match digits.len() {
            3 => {
                let v: Vec<u8> = digits
                    .chars()
                    .map(|c| u8::from_str_radix(&c.to_string(), 16).unwrap_or(0))
                    .collect();
                Some(RgbaColor::opaque(v[0] * 17, v[1] * 17, v[2] * 17))
            }
            6 | 8 => {
                let bytes: Vec<u8> = (0..digits.len())
                    .step_by(2)
                    .filter_map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
                    .collect();
                if bytes.len() == 3 {
                    Some(RgbaColor::opaque(bytes[0], bytes[1], bytes[2]))
                } else {
                    Some(RgbaColor {
                        r: bytes[0],
                        g: bytes[1],
                        b: bytes[2],
                        a: bytes[3],
                    })
                }
            }
            _ => None,
        };
    }

    if let Some(caps) = RGB_RE.captures(trimmed) {
        let parse = |i: usize| caps[i].parse::<u16>().ok().filter(|v| *v <= 255);
        if let (Some(r), Some(g), Some(b)) = (parse(1), parse(2), parse(3)) {
            return Some(RgbaColor::opaque(r as u8, g as u8, b as u8));
        }
    }

    None
}

pub struct ColorPlugin;

impl ContentPlugin for ColorPlugin {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Color
    }

    fn claims(&self, _flavor: &str) -> bool {
        false
    }

    fn build(&self, _slot: &FlavorSlot) -> Result<Option<BuiltItem>, PluginError> {
        Ok(None)
    }

    fn render(&self, item: &PasteItem, _record_dir: &Path) -> Option<FlavorSlot> {
        match &item.payload {
            Payload::Color(color) => {
                Some(FlavorSlot::new(FLAVOR_TEXT, color.to_hex().into_bytes()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_forms() {
        assert_eq!(parse_color("#ff8800"), Some(RgbaColor::opaque(255, 136, 0)));
        assert_eq!(parse_color("#f80"), Some(RgbaColor::opaque(255, 136, 0)));
        assert_eq!(
            parse_color("#ff880080"),
            Some(RgbaColor {
                r: 255,
                g: 136,
                b: 0,
                a: 128
            })
        );
    }

    #[test]
    fn parses_rgb_function() {
        assert_eq!(
            parse_color("rgb(12, 34, 56)"),
            Some(RgbaColor::opaque(12, 34, 56))
        );
        assert_eq!(parse_color("rgb(300, 0, 0)"), None);
    }

    #[test]
    fn rejects_plain_text() {
        assert_eq!(parse_color("hello"), None);
        assert_eq!(parse_color("#ff88"), None);
    }
}
