//! Two-instance pairing and replication tests over the loopback
//! transport: token handshake, record push with dedup on replay, lazy
//! file pull, tombstone propagation and trust revocation.

use std::sync::Arc;
use std::time::Duration;

use pastebeam::clipboard::FlavorSlot;
use pastebeam::collect::Collector;
use pastebeam::net::{LoopbackNetwork, Transport, WireEnvelope, WireKind};
use pastebeam::pairing::{DeviceKeys, PairingManager};
use pastebeam::peers::{PeerRegistry, TrustState};
use pastebeam::plugins::PluginRegistry;
use pastebeam::postprocess::PostProcessChain;
use pastebeam::record::{DeviceId, RecordState};
use pastebeam::render::RecordingRenderer;
use pastebeam::store::{MemoryStore, PasteStore, RecordQuery, TaskStore};
use pastebeam::sync::{PeerClient, SyncManager};
use pastebeam::tasks::{process_one, TaskContext, TaskHandlers};
use uuid::Uuid;

struct Instance {
    device_id: DeviceId,
    endpoint: String,
    store: Arc<MemoryStore>,
    collector: Arc<Collector>,
    registry: Arc<PeerRegistry>,
    pairing: Arc<PairingManager>,
    sync: Arc<SyncManager>,
    ctx: Arc<TaskContext>,
}

async fn make_instance(
    net: &Arc<LoopbackNetwork>,
    name: &str,
    endpoint: &str,
    data_dir: std::path::PathBuf,
) -> Instance {
    let device_id = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(PeerRegistry::in_memory());
    let keys = Arc::new(DeviceKeys::generate().unwrap());

    let collector = Arc::new(Collector::new(
        device_id,
        store.clone(),
        store.clone(),
        Arc::new(PluginRegistry::stock()),
        Arc::new(PostProcessChain::stock()),
        data_dir.clone(),
        50,
    ));
    let pairing = Arc::new(PairingManager::new(
        keys,
        device_id,
        name.to_string(),
        Arc::clone(&registry),
    ));
    let sync = Arc::new(SyncManager::new(
        device_id,
        Arc::clone(&registry),
        store.clone(),
        store.clone(),
        net.clone(),
        Arc::clone(&collector),
        Arc::clone(&pairing),
        4,
        data_dir.clone(),
    ));
    net.register(endpoint, sync.clone()).await;

    let ctx = Arc::new(TaskContext {
        store: store.clone(),
        tasks: store.clone(),
        renderer: Arc::new(RecordingRenderer::new()),
        peer_client: sync.clone(),
        data_dir,
        task_retention: chrono::Duration::hours(24),
        tombstone_retention: chrono::Duration::days(7),
    });

    Instance {
        device_id,
        endpoint: endpoint.to_string(),
        store,
        collector,
        registry,
        pairing,
        sync,
        ctx,
    }
}

/// Pair B (requester) against A (responder) and teach each side the
/// other's endpoint, standing in for the discovery service.
async fn pair(net: &Arc<LoopbackNetwork>, a: &Instance, b: &Instance) {
    let token = a.pairing.display_token().await;
    let paired_with = b
        .pairing
        .request_pairing(net.as_ref(), &a.endpoint, token, None)
        .await
        .unwrap();
    assert_eq!(paired_with, a.device_id);

    a.registry
        .observe_discovered(&pastebeam::discovery::DiscoveredPeer {
            device_id: b.device_id,
            name: "b".into(),
            endpoint: b.endpoint.clone(),
            metadata: Default::default(),
        })
        .await;
    b.registry
        .observe_discovered(&pastebeam::discovery::DiscoveredPeer {
            device_id: a.device_id,
            name: "a".into(),
            endpoint: a.endpoint.clone(),
            metadata: Default::default(),
        })
        .await;
}

async fn drain_tasks(instance: &Instance, handlers: &TaskHandlers) {
    for _ in 0..16 {
        let claimed = instance.ctx.tasks.claim_pending(8).await.unwrap();
        if claimed.is_empty() {
            break;
        }
        for task in claimed {
            process_one(&instance.ctx, handlers, task).await;
        }
    }
}

fn png_bytes() -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(&[0u8; 64]);
    bytes
}

#[tokio::test]
async fn pairing_establishes_mutual_trust() {
    let tmp = tempfile::tempdir().unwrap();
    let net = Arc::new(LoopbackNetwork::new());
    let a = make_instance(&net, "a", "a:9410", tmp.path().join("a")).await;
    let b = make_instance(&net, "b", "b:9410", tmp.path().join("b")).await;

    pair(&net, &a, &b).await;

    let a_sees_b = a.registry.get(b.device_id).await.unwrap();
    assert_eq!(a_sees_b.trust, TrustState::Paired);
    assert!(a_sees_b.session_key.is_some());

    let b_sees_a = b.registry.get(a.device_id).await.unwrap();
    assert_eq!(b_sees_a.trust, TrustState::Paired);
    assert!(b_sees_a.session_key.is_some());
}

#[tokio::test]
async fn wrong_token_leaves_trust_unchanged() {
    let tmp = tempfile::tempdir().unwrap();
    let net = Arc::new(LoopbackNetwork::new());
    let a = make_instance(&net, "a", "a:9410", tmp.path().join("a")).await;
    let b = make_instance(&net, "b", "b:9410", tmp.path().join("b")).await;

    let token = a.pairing.display_token().await;
    let wrong = if token == 999_999 { 100_000 } else { token + 1 };
    let result = b
        .pairing
        .request_pairing(net.as_ref(), &a.endpoint, wrong, None)
        .await;
    assert!(result.is_err());
    assert!(a.registry.get(b.device_id).await.is_none());
    assert!(b.registry.get(a.device_id).await.is_none());
}

#[tokio::test]
async fn pushed_record_lands_once_even_when_replayed() {
    let tmp = tempfile::tempdir().unwrap();
    let net = Arc::new(LoopbackNetwork::new());
    let a = make_instance(&net, "a", "a:9410", tmp.path().join("a")).await;
    let b = make_instance(&net, "b", "b:9410", tmp.path().join("b")).await;
    pair(&net, &a, &b).await;

    let id = a
        .collector
        .capture_local(vec![FlavorSlot::text("hello")], None)
        .await
        .unwrap()
        .unwrap();
    let record = a.store.get(id).await.unwrap().unwrap();

    a.sync.push_record(&record).await.unwrap();
    // Replay the identical push: dedup makes it a no-op.
    a.sync.push_record(&record).await.unwrap();

    let loaded = b
        .store
        .query(&RecordQuery {
            states: Some(vec![RecordState::Loaded]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(loaded.len(), 1);
    let ingested = &loaded[0];
    assert!(ingested.remote);
    assert_eq!(ingested.owner, a.device_id);
    assert_eq!(ingested.origin_id, Some(id));
    assert_eq!((ingested.hash.clone(), ingested.size), (record.hash, record.size));
}

#[tokio::test]
async fn file_payload_is_pulled_lazily_in_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let net = Arc::new(LoopbackNetwork::new());
    let a = make_instance(&net, "a", "a:9410", tmp.path().join("a")).await;
    let b = make_instance(&net, "b", "b:9410", tmp.path().join("b")).await;
    pair(&net, &a, &b).await;

    let payload = png_bytes();
    let id = a
        .collector
        .capture_local(
            vec![FlavorSlot::new("image/png", payload.clone())],
            None,
        )
        .await
        .unwrap()
        .unwrap();
    let record = a.store.get(id).await.unwrap().unwrap();
    assert!(record.stored_files()[0].present);

    a.sync.push_record(&record).await.unwrap();

    // B now has the record with absent bytes and a pending pull task.
    let ingested = b
        .store
        .query(&RecordQuery {
            remote: Some(true),
            ..Default::default()
        })
        .await
        .unwrap()
        .remove(0);
    assert!(!ingested.stored_files()[0].present);

    drain_tasks(&b, &TaskHandlers::stock()).await;

    let after = b.store.get(ingested.id).await.unwrap().unwrap();
    assert!(after.stored_files()[0].present);
    let on_disk = tokio::fs::read(
        tmp.path()
            .join("b")
            .join(after.owner.to_string())
            .join(after.id.to_string())
            .join("image-0.png"),
    )
    .await
    .unwrap();
    assert_eq!(on_disk, payload);
}

#[tokio::test]
async fn tombstone_propagates_with_lww() {
    let tmp = tempfile::tempdir().unwrap();
    let net = Arc::new(LoopbackNetwork::new());
    let a = make_instance(&net, "a", "a:9410", tmp.path().join("a")).await;
    let b = make_instance(&net, "b", "b:9410", tmp.path().join("b")).await;
    pair(&net, &a, &b).await;

    // Drive A's outbound loop so delete events broadcast.
    let events = a.collector.subscribe();
    let (_discovery_tx, discovery_rx) = tokio::sync::mpsc::channel(1);
    let sync_loop = tokio::spawn(Arc::clone(&a.sync).run(events, discovery_rx));

    let id = a
        .collector
        .capture_local(vec![FlavorSlot::text("short-lived")], None)
        .await
        .unwrap()
        .unwrap();
    let record = a.store.get(id).await.unwrap().unwrap();
    a.sync.push_record(&record).await.unwrap();

    let ingested = b
        .store
        .query(&RecordQuery {
            remote: Some(true),
            ..Default::default()
        })
        .await
        .unwrap()
        .remove(0);
    assert_eq!(ingested.state, RecordState::Loaded);

    a.collector.delete_record(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = b.store.get(ingested.id).await.unwrap().unwrap();
    assert_eq!(after.state, RecordState::Deleted);

    a.sync.stop();
    let _ = sync_loop.await;
}

#[tokio::test]
async fn undecryptable_traffic_revokes_trust() {
    let tmp = tempfile::tempdir().unwrap();
    let net = Arc::new(LoopbackNetwork::new());
    let a = make_instance(&net, "a", "a:9410", tmp.path().join("a")).await;
    let b = make_instance(&net, "b", "b:9410", tmp.path().join("b")).await;
    pair(&net, &a, &b).await;

    // Garbage ciphertext under A's identity.
    let reply = net
        .request(
            &b.endpoint,
            WireEnvelope::new(a.device_id, WireKind::Sync, vec![0u8; 64]),
        )
        .await
        .unwrap();
    assert_eq!(reply.kind, WireKind::Error);

    let peer = b.registry.get(a.device_id).await.unwrap();
    assert_eq!(peer.trust, TrustState::Untrusted);
    assert!(peer.session_key.is_none());

    // Subsequent pushes from B to A's record are refused locally.
    let id = b
        .collector
        .capture_local(vec![FlavorSlot::text("after revocation")], None)
        .await
        .unwrap()
        .unwrap();
    let record = b.store.get(id).await.unwrap().unwrap();
    // No paired peers remain, so push is a successful no-op.
    b.sync.push_record(&record).await.unwrap();
    assert!(a
        .store
        .query(&RecordQuery {
            remote: Some(true),
            ..Default::default()
        })
        .await
        .unwrap()
        .is_empty());
}
