//! S2 - quorum replication: both configured peers see an identical REPLICATE call
//! for the full insert.

mod support;

use std::{io::Cursor, sync::Arc};

use blobby::namespace::Storage;
use blobby_common::{Algorithm, HashComputer};
use support::{build_node, FakeRemote};

#[tokio::test]
async fn both_replicas_receive_identical_replicate_calls() {
    let remote_a = Arc::new(FakeRemote::new(2));
    let remote_b = Arc::new(FakeRemote::new(3));
    let remotes: Vec<Arc<dyn blobby::remote::Remote>> = vec![remote_a.clone(), remote_b.clone()];
    let node = build_node(remotes, 2).await;
    let storage = Storage::new(node.shared.clone());
    storage.start().await.unwrap();

    let payload = vec![b'x'; 100];
    let token = storage.insert(Cursor::new(payload.clone()), None).await.unwrap();
    assert_eq!(token.start, 0);
    assert_eq!(token.length, 100);

    let mut expected_hasher = HashComputer::new(Algorithm::Keyed64);
    expected_hasher.update(&payload);
    let expected_hash = expected_hasher.hash();

    for remote in [&remote_a, &remote_b] {
        let calls = remote.replicated.lock().unwrap();
        assert_eq!(calls.len(), 1, "expected exactly one REPLICATE call");
        let (start, data, hash) = &calls[0];
        assert_eq!(*start, 0);
        assert_eq!(data.len(), 100);
        assert_eq!(hash, &expected_hash);
    }
    assert_eq!(
        remote_a.replicated.lock().unwrap()[0].2,
        remote_b.replicated.lock().unwrap()[0].2,
        "both peers must see the same Hash for the same bytes"
    );

    storage.stop().await;
}
