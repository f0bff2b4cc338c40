//! Scriptable clipboard port for tests
//!
//! Keeps flavor slots verbatim (including custom marker flavors), bumps
//! the change generation on every write, and can be told to fail the
//! next N reads to exercise the monitor's backoff path.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ClipboardError, ClipboardPort, FlavorSlot};

#[derive(Default)]
struct MockState {
    generation: u64,
    slots: Vec<FlavorSlot>,
    app: Option<String>,
    fail_reads: u32,
    written: Vec<Vec<FlavorSlot>>,
}

#[derive(Default)]
pub struct MockClipboard {
    state: Mutex<MockState>,
    usable: std::sync::atomic::AtomicBool,
}

impl MockClipboard {
    pub fn new() -> Self {
        let mock = Self::default();
        mock.usable
            .store(true, std::sync::atomic::Ordering::SeqCst);
        mock
    }

    /// Simulate another process writing to the clipboard.
    pub async fn set_contents(&self, slots: Vec<FlavorSlot>, app: Option<String>) {
        let mut state = self.state.lock().await;
        state.slots = slots;
        state.app = app;
        state.generation += 1;
    }

    /// Fail the next `n` reads with a transient busy error.
    pub async fn fail_next_reads(&self, n: u32) {
        self.state.lock().await.fail_reads = n;
    }

    pub fn set_usable(&self, usable: bool) {
        self.usable
            .store(usable, std::sync::atomic::Ordering::SeqCst);
    }

    /// Slots written through the port, oldest first.
    pub async fn written(&self) -> Vec<Vec<FlavorSlot>> {
        self.state.lock().await.written.clone()
    }
}

#[async_trait]
impl ClipboardPort for MockClipboard {
    async fn poll_change_count(&self) -> Result<u64, ClipboardError> {
        Ok(self.state.lock().await.generation)
    }

    async fn read_contents(&self) -> Result<Vec<FlavorSlot>, ClipboardError> {
        let mut state = self.state.lock().await;
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(ClipboardError::Busy("scripted failure".into()));
        }
        if state.slots.is_empty() {
            return Err(ClipboardError::NoContent);
        }
        Ok(state.slots.clone())
    }

    async fn write_contents(&self, slots: &[FlavorSlot]) -> Result<(), ClipboardError> {
        let mut state = self.state.lock().await;
        state.written.push(slots.to_vec());
        state.slots = slots.to_vec();
        state.generation += 1;
        Ok(())
    }

    async fn current_app(&self) -> Option<String> {
        self.state.lock().await.app.clone()
    }

    fn is_usable(&self) -> bool {
        self.usable.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
