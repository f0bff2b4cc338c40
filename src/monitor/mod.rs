//! Clipboard monitor
//!
//! One dedicated loop per instance: watch the native change generation,
//! read contents when it moves, filter self-authored and excluded
//! changes, and hand each accepted change to a new collection session.
//! Native reads can catch another process mid-write, so reads retry
//! with exponential backoff while the port reports itself usable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clipboard::{has_origin_marker, ClipboardError, ClipboardPort, FlavorSlot};
use crate::collect::Collector;

/// Initial backoff delay for transient native read failures.
const BACKOFF_INITIAL: Duration = Duration::from_millis(20);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Running,
}

pub struct ClipboardMonitor {
    port: Arc<dyn ClipboardPort>,
    collector: Arc<Collector>,
    poll_interval: Duration,
    excluded_apps: Vec<String>,
    capture_at_launch: bool,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl ClipboardMonitor {
    pub fn new(
        port: Arc<dyn ClipboardPort>,
        collector: Arc<Collector>,
        poll_interval: Duration,
        excluded_apps: Vec<String>,
        capture_at_launch: bool,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            port,
            collector,
            poll_interval,
            excluded_apps: excluded_apps
                .into_iter()
                .map(|app| app.to_lowercase())
                .collect(),
            capture_at_launch,
            running: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn state(&self) -> MonitorState {
        if self.running.load(Ordering::SeqCst) {
            MonitorState::Running
        } else {
            MonitorState::Stopped
        }
    }

    /// Stop the poll loop. In-flight collection sessions are not
    /// cancelled.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Run the poll loop until stopped.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        info!(port = self.port.name(), "clipboard monitor running");

        let mut stop_rx = self.stop_tx.subscribe();
        let mut last_generation: Option<u64> = None;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let generation = match self.port.poll_change_count().await {
                Ok(generation) => generation,
                Err(e) => {
                    warn!("failed to poll clipboard generation: {e}");
                    continue;
                }
            };

            match last_generation {
                None => {
                    // The generation observed at startup reflects
                    // whatever was on the clipboard before launch.
                    last_generation = Some(generation);
                    if !self.capture_at_launch {
                        continue;
                    }
                }
                Some(last) if last == generation => continue,
                Some(_) => {
                    last_generation = Some(generation);
                }
            }

            let slots = match self.read_with_backoff().await {
                Ok(slots) => slots,
                Err(ClipboardError::NoContent) => continue,
                Err(e) => {
                    warn!("giving up on clipboard read: {e}");
                    continue;
                }
            };

            if has_origin_marker(&slots) {
                debug!("skipping self-authored clipboard change");
                continue;
            }

            let source_app = self.port.current_app().await;
            if let Some(app) = &source_app {
                if self.excluded_apps.contains(&app.to_lowercase()) {
                    debug!(app = %app, "skipping change from excluded application");
                    continue;
                }
            }

            let collector = Arc::clone(&self.collector);
            tokio::spawn(async move {
                if let Err(e) = collector.capture_local(slots, source_app).await {
                    warn!("collection session failed: {e}");
                }
            });
        }

        self.running.store(false, Ordering::SeqCst);
        info!("clipboard monitor stopped");
    }

    /// Read clipboard contents, retrying transient failures with
    /// exponential backoff while the port stays usable.
    async fn read_with_backoff(&self) -> Result<Vec<FlavorSlot>, ClipboardError> {
        let mut delay = BACKOFF_INITIAL;
        loop {
            match self.port.read_contents().await {
                Ok(slots) => return Ok(slots),
                Err(e) if e.is_transient() && self.port.is_usable() && delay <= BACKOFF_CAP * 2 => {
                    let wait = delay.min(BACKOFF_CAP);
                    debug!("transient clipboard read failure, retrying in {wait:?}: {e}");
                    tokio::time::sleep(wait).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{mock::MockClipboard, FLAVOR_ORIGIN_MARKER};
    use crate::plugins::PluginRegistry;
    use crate::postprocess::PostProcessChain;
    use crate::record::RecordState;
    use crate::store::{MemoryStore, PasteStore, RecordQuery};
    use uuid::Uuid;

    struct Harness {
        mock: Arc<MockClipboard>,
        store: Arc<MemoryStore>,
        monitor: Arc<ClipboardMonitor>,
    }

    fn harness(excluded: Vec<String>, capture_at_launch: bool) -> Harness {
        let mock = Arc::new(MockClipboard::new());
        let store = Arc::new(MemoryStore::new());
        let collector = Arc::new(Collector::new(
            Uuid::new_v4(),
            store.clone(),
            store.clone(),
            Arc::new(PluginRegistry::stock()),
            Arc::new(PostProcessChain::stock()),
            std::env::temp_dir().join(format!("pastebeam-test-{}", Uuid::new_v4())),
            50,
        ));
        let monitor = Arc::new(ClipboardMonitor::new(
            mock.clone(),
            collector,
            Duration::from_millis(10),
            excluded,
            capture_at_launch,
        ));
        Harness {
            mock,
            store,
            monitor,
        }
    }

    async fn loaded_count(store: &MemoryStore) -> usize {
        store
            .query(&RecordQuery {
                states: Some(vec![RecordState::Loaded]),
                ..Default::default()
            })
            .await
            .unwrap()
            .len()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn captures_external_change() {
        let h = harness(Vec::new(), false);
        let handle = tokio::spawn(Arc::clone(&h.monitor).run());
        settle().await;

        h.mock
            .set_contents(vec![FlavorSlot::text("fresh content")], None)
            .await;
        settle().await;

        assert_eq!(loaded_count(&h.store).await, 1);
        h.monitor.stop();
        handle.await.unwrap();
        assert_eq!(h.monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn skips_self_authored_change() {
        let h = harness(Vec::new(), false);
        let handle = tokio::spawn(Arc::clone(&h.monitor).run());
        settle().await;

        h.mock
            .set_contents(
                vec![
                    FlavorSlot::text("our own paste"),
                    FlavorSlot::new(FLAVOR_ORIGIN_MARKER, b"self".to_vec()),
                ],
                None,
            )
            .await;
        settle().await;

        assert_eq!(loaded_count(&h.store).await, 0);
        h.monitor.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn skips_excluded_application() {
        let h = harness(vec!["SecretVault".into()], false);
        let handle = tokio::spawn(Arc::clone(&h.monitor).run());
        settle().await;

        h.mock
            .set_contents(
                vec![FlavorSlot::text("hunter2")],
                Some("secretvault".into()),
            )
            .await;
        settle().await;
        assert_eq!(loaded_count(&h.store).await, 0);

        h.mock
            .set_contents(vec![FlavorSlot::text("normal copy")], Some("Editor".into()))
            .await;
        settle().await;
        assert_eq!(loaded_count(&h.store).await, 1);

        h.monitor.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn startup_content_ignored_by_default() {
        let h = harness(Vec::new(), false);
        // Content present before the monitor starts.
        h.mock
            .set_contents(vec![FlavorSlot::text("pre-launch")], None)
            .await;

        let handle = tokio::spawn(Arc::clone(&h.monitor).run());
        settle().await;
        assert_eq!(loaded_count(&h.store).await, 0);

        h.monitor.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn startup_content_captured_when_opted_in() {
        let h = harness(Vec::new(), true);
        h.mock
            .set_contents(vec![FlavorSlot::text("pre-launch")], None)
            .await;

        let handle = tokio::spawn(Arc::clone(&h.monitor).run());
        settle().await;
        assert_eq!(loaded_count(&h.store).await, 1);

        h.monitor.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn transient_read_failures_are_retried() {
        let h = harness(Vec::new(), false);
        let handle = tokio::spawn(Arc::clone(&h.monitor).run());
        settle().await;

        h.mock.fail_next_reads(2).await;
        h.mock
            .set_contents(vec![FlavorSlot::text("eventually readable")], None)
            .await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(loaded_count(&h.store).await, 1);
        h.monitor.stop();
        handle.await.unwrap();
    }
}
