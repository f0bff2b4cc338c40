//! Native clipboard port
//!
//! Platform clipboards differ wildly in how change detection and flavor
//! enumeration work, so everything above this module talks to one
//! capability trait: poll a change counter, read/write ordered flavor
//! slots, and ask for the foreground application. The concrete port is
//! selected once at startup by target OS, never by runtime inspection.

use async_trait::async_trait;
use thiserror::Error;

pub mod mock;
pub mod system;

/// Plain UTF-8 text.
pub const FLAVOR_TEXT: &str = "text/plain";
/// HTML markup.
pub const FLAVOR_HTML: &str = "text/html";
/// Rich text format bytes.
pub const FLAVOR_RTF: &str = "text/rtf";
/// PNG image bytes.
pub const FLAVOR_PNG: &str = "image/png";
/// Raw RGBA bitmap: 8-byte header (width u32 LE, height u32 LE) + pixels.
pub const FLAVOR_RGBA: &str = "image/x-rgba";
/// Newline-separated absolute file paths.
pub const FLAVOR_FILE_LIST: &str = "application/x-file-list";
/// Local-only marker written alongside our own writes so the monitor
/// never re-ingests them. Carries the writing device id.
pub const FLAVOR_ORIGIN_MARKER: &str = "application/x-pastebeam-origin";

/// One native representation of the current clipboard contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlavorSlot {
    pub flavor: String,
    pub data: Vec<u8>,
}

impl FlavorSlot {
    pub fn new(flavor: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            flavor: flavor.into(),
            data,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FLAVOR_TEXT, text.into().into_bytes())
    }
}

/// Returns true when the slot list was authored by this instance.
pub fn has_origin_marker(slots: &[FlavorSlot]) -> bool {
    slots.iter().any(|s| s.flavor == FLAVOR_ORIGIN_MARKER)
}

#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Platform-specific failure.
    #[error("platform error: {0}")]
    Platform(String),

    /// The native clipboard is mid-write by another process; callers
    /// retry with backoff.
    #[error("clipboard busy: {0}")]
    Busy(String),

    #[error("content too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("no clipboard content available")]
    NoContent,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClipboardError {
    /// Transient errors are retried with backoff and never surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClipboardError::Busy(_))
    }
}

/// Capability interface over the platform clipboard and window system.
#[async_trait]
pub trait ClipboardPort: Send + Sync {
    /// Current change generation. Monotonically increases on every
    /// clipboard write by any process.
    async fn poll_change_count(&self) -> Result<u64, ClipboardError>;

    /// Read the current contents as ordered flavor slots. Order matches
    /// native flavor enumeration order.
    async fn read_contents(&self) -> Result<Vec<FlavorSlot>, ClipboardError>;

    /// Replace the clipboard contents.
    async fn write_contents(&self, slots: &[FlavorSlot]) -> Result<(), ClipboardError>;

    /// Name of the foreground application, when the platform exposes it.
    async fn current_app(&self) -> Option<String>;

    /// Whether the native clipboard can be read right now. Gates the
    /// monitor's backoff retry.
    fn is_usable(&self) -> bool;

    fn name(&self) -> &str;
}

/// Select the clipboard port for the current platform.
pub fn select_port() -> Result<Box<dyn ClipboardPort>, ClipboardError> {
    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "windows"))]
    {
        Ok(Box::new(system::SystemClipboard::new()?))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        Err(ClipboardError::Platform("unsupported platform".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_marker_detection() {
        let plain = vec![FlavorSlot::text("hello")];
        assert!(!has_origin_marker(&plain));

        let marked = vec![
            FlavorSlot::text("hello"),
            FlavorSlot::new(FLAVOR_ORIGIN_MARKER, b"device".to_vec()),
        ];
        assert!(has_origin_marker(&marked));
    }

    #[test]
    fn busy_is_transient() {
        assert!(ClipboardError::Busy("mid-write".into()).is_transient());
        assert!(!ClipboardError::NoContent.is_transient());
    }
}
