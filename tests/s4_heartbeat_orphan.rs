//! S4 - heartbeat orphan: a replica that stops hearing from its primary uploads
//! its spool on its own once `heartbeat_time` elapses.

mod support;

use std::time::Duration;

use blobby::namespace::Storage;
use blobby_common::{Algorithm, FileId, HashComputer};
use bytes::Bytes;
use support::build_node;

#[tokio::test]
async fn orphaned_replica_self_promotes_and_uploads() {
    let node = build_node(Vec::new(), 0).await;
    let storage = Storage::new(node.shared.clone());
    storage.start().await.unwrap();

    let fid = FileId::new(1_700_000_000, 7, node.shared.settings.machine_id);
    storage.initialize_replica(fid).await.unwrap();

    let payload = Bytes::from_static(b"ABCDEFGHIJ");
    let mut hasher = HashComputer::new(Algorithm::Keyed64);
    hasher.update(&payload);
    let hash = hasher.hash();
    storage.replicate_into(fid, 0, payload.clone(), &hash).await.unwrap();

    // No further heartbeat is sent. `heartbeat_time` is 60ms; give the orphan watchdog and the
    // upload cascade it triggers comfortable headroom.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let keys = node.object_store.keys();
    assert_eq!(keys.len(), 1, "expected the orphaned replica to upload exactly once, got {keys:?}");
    let uploaded = node.object_store.get(&keys[0]).unwrap();
    assert_eq!(&uploaded[..], &payload[..]);

    storage.stop().await;
}
