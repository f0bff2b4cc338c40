//! End-to-end capture pipeline tests: mock clipboard port -> monitor ->
//! collection session -> sqlite store, plus native write-back.

use std::sync::Arc;
use std::time::Duration;

use pastebeam::clipboard::{
    mock::MockClipboard, ClipboardPort, FlavorSlot, FLAVOR_HTML, FLAVOR_ORIGIN_MARKER,
};
use pastebeam::collect::Collector;
use pastebeam::monitor::ClipboardMonitor;
use pastebeam::plugins::PluginRegistry;
use pastebeam::postprocess::PostProcessChain;
use pastebeam::record::{PayloadKind, RecordState};
use pastebeam::store::{PasteStore, RecordQuery, SqliteStore};
use uuid::Uuid;

struct Pipeline {
    mock: Arc<MockClipboard>,
    store: Arc<SqliteStore>,
    collector: Arc<Collector>,
    monitor: Arc<ClipboardMonitor>,
    plugins: Arc<PluginRegistry>,
    data_dir: std::path::PathBuf,
}

fn pipeline(tmp: &tempfile::TempDir) -> Pipeline {
    let mock = Arc::new(MockClipboard::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let plugins = Arc::new(PluginRegistry::stock());
    let data_dir = tmp.path().join("data");
    let collector = Arc::new(Collector::new(
        Uuid::new_v4(),
        store.clone(),
        store.clone(),
        plugins.clone(),
        Arc::new(PostProcessChain::stock()),
        data_dir.clone(),
        50,
    ));
    let monitor = Arc::new(ClipboardMonitor::new(
        mock.clone(),
        collector.clone(),
        Duration::from_millis(10),
        Vec::new(),
        false,
    ));
    Pipeline {
        mock,
        store,
        collector,
        monitor,
        plugins,
        data_dir,
    }
}

async fn loaded_records(store: &SqliteStore) -> Vec<pastebeam::record::PasteRecord> {
    store
        .query(&RecordQuery {
            states: Some(vec![RecordState::Loaded]),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn copy_lands_in_store_with_sorted_items() {
    let tmp = tempfile::tempdir().unwrap();
    let p = pipeline(&tmp);
    let handle = tokio::spawn(Arc::clone(&p.monitor).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    p.mock
        .set_contents(
            vec![
                FlavorSlot::text("Hello rich world"),
                FlavorSlot::new(FLAVOR_HTML, b"<p>Hello <i>rich</i> world!</p>".to_vec()),
            ],
            Some("Editor".into()),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let records = loaded_records(&p.store).await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.source_app.as_deref(), Some("Editor"));
    // Markup is not redundant (text differs), so both survive; the
    // priority sort makes html the primary item.
    assert_eq!(record.items.len(), 2);
    assert_eq!(record.primary_item().unwrap().kind(), PayloadKind::Html);

    p.monitor.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn repeated_copy_dedups_within_window() {
    let tmp = tempfile::tempdir().unwrap();
    let p = pipeline(&tmp);
    let handle = tokio::spawn(Arc::clone(&p.monitor).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    p.mock
        .set_contents(vec![FlavorSlot::text("copied twice")], None)
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    // An intervening different copy, then the same bytes again.
    p.mock
        .set_contents(vec![FlavorSlot::text("something else")], None)
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    p.mock
        .set_contents(vec![FlavorSlot::text("copied twice")], None)
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let records = loaded_records(&p.store).await;
    assert_eq!(records.len(), 2);

    p.monitor.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn url_text_derives_url_item() {
    let tmp = tempfile::tempdir().unwrap();
    let p = pipeline(&tmp);

    let id = p
        .collector
        .capture_local(vec![FlavorSlot::text("https://example.com/docs")], None)
        .await
        .unwrap()
        .unwrap();

    let record = p.store.get(id).await.unwrap().unwrap();
    assert!(record.has_kind(PayloadKind::Url));
    assert!(record.has_kind(PayloadKind::Text));
    // Url outranks plain text in the priority order.
    assert_eq!(record.primary_item().unwrap().kind(), PayloadKind::Url);
}

#[tokio::test]
async fn write_back_is_not_reingested() {
    let tmp = tempfile::tempdir().unwrap();
    let p = pipeline(&tmp);
    let handle = tokio::spawn(Arc::clone(&p.monitor).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let id = p
        .collector
        .capture_local(vec![FlavorSlot::text("paste me back")], None)
        .await
        .unwrap()
        .unwrap();
    let record = p.store.get(id).await.unwrap().unwrap();

    // Re-emit the record to the native clipboard the way a paste
    // action would.
    let slots = p.plugins.render_record(
        &record,
        &p.data_dir
            .join(record.owner.to_string())
            .join(record.id.to_string()),
        p.collector.device_id(),
    );
    assert_eq!(slots.last().unwrap().flavor, FLAVOR_ORIGIN_MARKER);
    p.mock.write_contents(&slots).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Still exactly one loaded record: the marker suppressed re-ingest.
    assert_eq!(loaded_records(&p.store).await.len(), 1);

    p.monitor.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn corrupt_slot_drops_item_but_keeps_session() {
    let tmp = tempfile::tempdir().unwrap();
    let p = pipeline(&tmp);

    let id = p
        .collector
        .capture_local(
            vec![
                // Invalid RTF (missing header) is dropped...
                FlavorSlot::new("text/rtf", b"not rtf at all".to_vec()),
                // ...while the text slot still loads.
                FlavorSlot::text("survivor"),
            ],
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let record = p.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.items.len(), 1);
    assert_eq!(record.items[0].kind(), PayloadKind::Text);
}
