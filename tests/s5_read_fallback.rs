//! S5 - read fallback: with no local primary or replica for the FID, the resolver
//! tries the owning peer, and on a 404-equivalent from that peer falls through to the object
//! store.

mod support;

use std::sync::Arc;

use blobby_common::{FileId, IdToken};
use support::{build_node, FakeRemote};

#[tokio::test]
async fn falls_through_peer_miss_to_object_store() {
    // The FID's owning machine is 99. FakeRemote::new(99) models that peer; its default
    // `read` returns Ok(None) (404-equivalent), so the resolver must fall through to the
    // object store rather than stopping at the peer miss.
    let remote = Arc::new(FakeRemote::new(99)) as Arc<dyn blobby::remote::Remote>;
    let node = build_node(vec![remote], 0).await;
    let storage = blobby::namespace::Storage::new(node.shared.clone());
    storage.start().await.unwrap();

    let fid = FileId::new(1_700_000_000, 42, 99); // machine 99: not this node (machine_id = 1)
    let token = IdToken::new(fid, 0, 5);
    let key = node
        .shared
        .object_key(fid.epoch_seconds(), fid.counter(), fid.machine_id());
    node.object_store.seed(&key, bytes::Bytes::from_static(b"fromS3"));

    let bytes = storage.read(token, false).await.unwrap();
    assert_eq!(&bytes[..], b"fromS");

    storage.stop().await;
}
