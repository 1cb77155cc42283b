//! S1 - single-node round trip: insert, read it straight back, and watch it seal
//! and upload once `upload_older` elapses.

mod support;

use std::{io::Cursor, time::Duration};

use blobby::namespace::Storage;
use support::build_node;

#[tokio::test]
async fn insert_read_back_then_upload() {
    let node = build_node(Vec::new(), 0).await;
    let storage = Storage::new(node.shared.clone());
    storage.start().await.unwrap();

    let token = storage
        .insert(Cursor::new(b"ABCDEFGHIJ".to_vec()), None)
        .await
        .unwrap();
    assert_eq!(token.start, 0);
    assert_eq!(token.length, 10);

    let bytes = storage.read(token, false).await.unwrap();
    assert_eq!(&bytes[..], b"ABCDEFGHIJ");

    // `upload_older` is 40ms; give the seal -> upload cascade time to run on its worker queue.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let keys = node.object_store.keys();
    assert_eq!(keys.len(), 1, "expected exactly one uploaded object, got {keys:?}");
    let uploaded = node.object_store.get(&keys[0]).unwrap();
    assert_eq!(&uploaded[..], b"ABCDEFGHIJ");

    let expected_md5 = {
        use md5::{Digest, Md5};
        let mut hasher = Md5::new();
        hasher.update(b"ABCDEFGHIJ");
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect::<String>()
    };
    // MemoryObjectStore::put returns the hex MD5 as its fake ETag; the uploader only accepts the
    // upload if that matches, so reaching this point already proves the digests agreed, but
    // re-deriving it here pins the scenario's own expectation independent of uploader internals.
    let recomputed = {
        use md5::{Digest, Md5};
        let mut hasher = Md5::new();
        hasher.update(&uploaded[..]);
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect::<String>()
    };
    assert_eq!(recomputed, expected_md5);

    storage.stop().await;
}
