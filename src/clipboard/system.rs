//! arboard-backed clipboard port
//!
//! The OS clipboard gives us no portable change counter, so this port
//! derives one: every poll reads the current contents, hashes them, and
//! bumps a generation counter when the hash moves. Foreground-app
//! queries need the platform window port and are unavailable here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{
    ClipboardError, ClipboardPort, FlavorSlot, FLAVOR_HTML, FLAVOR_ORIGIN_MARKER, FLAVOR_RGBA,
    FLAVOR_TEXT,
};

pub struct SystemClipboard {
    inner: Mutex<arboard::Clipboard>,
    generation: AtomicU64,
    last_hash: Mutex<Option<[u8; 32]>>,
}

impl SystemClipboard {
    pub fn new() -> Result<Self, ClipboardError> {
        let clipboard = arboard::Clipboard::new()
            .map_err(|e| ClipboardError::Platform(e.to_string()))?;
        Ok(Self {
            inner: Mutex::new(clipboard),
            generation: AtomicU64::new(0),
            last_hash: Mutex::new(None),
        })
    }

    fn read_slots(&self) -> Result<Vec<FlavorSlot>, ClipboardError> {
        let mut clipboard = self
            .inner
            .lock()
            .map_err(|_| ClipboardError::Platform("clipboard mutex poisoned".into()))?;

        let mut slots = Vec::new();

        match clipboard.get_text() {
            Ok(text) if !text.is_empty() => slots.push(FlavorSlot::text(text)),
            Ok(_) => {}
            Err(arboard::Error::ContentNotAvailable) => {}
            Err(arboard::Error::ClipboardOccupied) => {
                return Err(ClipboardError::Busy("clipboard occupied".into()))
            }
            Err(e) => return Err(ClipboardError::Platform(e.to_string())),
        }

        match clipboard.get_image() {
            Ok(image) => {
                let mut data =
                    Vec::with_capacity(8 + image.bytes.len());
                data.extend_from_slice(&(image.width as u32).to_le_bytes());
                data.extend_from_slice(&(image.height as u32).to_le_bytes());
                data.extend_from_slice(&image.bytes);
                slots.push(FlavorSlot::new(FLAVOR_RGBA, data));
            }
            Err(arboard::Error::ContentNotAvailable) => {}
            Err(arboard::Error::ClipboardOccupied) => {
                return Err(ClipboardError::Busy("clipboard occupied".into()))
            }
            Err(e) => return Err(ClipboardError::Platform(e.to_string())),
        }

        Ok(slots)
    }
}

#[async_trait]
impl ClipboardPort for SystemClipboard {
    async fn poll_change_count(&self) -> Result<u64, ClipboardError> {
        let slots = self.read_slots()?;

        let mut hasher = Sha256::new();
        for slot in &slots {
            hasher.update(slot.flavor.as_bytes());
            hasher.update(&slot.data);
        }
        let hash: [u8; 32] = hasher.finalize().into();

        let mut last = self
            .last_hash
            .lock()
            .map_err(|_| ClipboardError::Platform("clipboard mutex poisoned".into()))?;
        if last.as_ref() != Some(&hash) {
            *last = Some(hash);
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.generation.load(Ordering::SeqCst))
    }

    async fn read_contents(&self) -> Result<Vec<FlavorSlot>, ClipboardError> {
        let slots = self.read_slots()?;
        if slots.is_empty() {
            return Err(ClipboardError::NoContent);
        }
        Ok(slots)
    }

    async fn write_contents(&self, slots: &[FlavorSlot]) -> Result<(), ClipboardError> {
        let mut clipboard = self
            .inner
            .lock()
            .map_err(|_| ClipboardError::Platform("clipboard mutex poisoned".into()))?;

        for slot in slots {
            match slot.flavor.as_str() {
                FLAVOR_TEXT => {
                    let text = String::from_utf8_lossy(&slot.data);
                    clipboard
                        .set_text(text.into_owned())
                        .map_err(|e| ClipboardError::Platform(e.to_string()))?;
                }
                FLAVOR_HTML => {
                    let html = String::from_utf8_lossy(&slot.data).into_owned();
                    clipboard
                        .set_html(html, None::<String>)
                        .map_err(|e| ClipboardError::Platform(e.to_string()))?;
                }
                FLAVOR_RGBA if slot.data.len() > 8 => {
                    let width =
                        u32::from_le_bytes([slot.data[0], slot.data[1], slot.data[2], slot.data[3]]);
                    let height =
                        u32::from_le_bytes([slot.data[4], slot.data[5], slot.data[6], slot.data[7]]);
                    let image = arboard::ImageData {
                        width: width as usize,
                        height: height as usize,
                        bytes: slot.data[8..].to_vec().into(),
                    };
                    clipboard
                        .set_image(image)
                        .map_err(|e| ClipboardError::Platform(e.to_string()))?;
                }
                FLAVOR_ORIGIN_MARKER => {
                    // arboard cannot register custom flavors; self-write
                    // suppression happens below by absorbing the new
                    // content hash without bumping the generation.
                }
                _ => {}
            }
        }
        drop(clipboard);

        // Absorb our own write: remember its hash but keep the
        // generation unchanged, so the monitor's next poll reports no
        // external change.
        let slots = self.read_slots()?;
        let mut hasher = Sha256::new();
        for slot in &slots {
            hasher.update(slot.flavor.as_bytes());
            hasher.update(&slot.data);
        }
        let hash: [u8; 32] = hasher.finalize().into();
        let mut last = self
            .last_hash
            .lock()
            .map_err(|_| ClipboardError::Platform("clipboard mutex poisoned".into()))?;
        *last = Some(hash);
        Ok(())
    }

    async fn current_app(&self) -> Option<String> {
        None
    }

    fn is_usable(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "system"
    }
}
