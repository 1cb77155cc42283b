//! S3 - offset mismatch: a REPLICATE call at the wrong `Start` permanently fails
//! the replica; the primary-seal consequence of that failure is exercised by
//! `primary::tests::peer_replicate_error_seals_and_rolls_back` in-crate.

mod support;

use blobby::{error::BlobbyError, namespace::Storage};
use blobby_common::{Algorithm, FileId, HashComputer};
use bytes::Bytes;
use support::build_node;

#[tokio::test]
async fn mismatched_start_fails_replica_permanently() {
    let node = build_node(Vec::new(), 0).await;
    let storage = Storage::new(node.shared.clone());
    storage.start().await.unwrap();

    let fid = FileId::new(1_700_000_000, 1, node.shared.settings.machine_id);
    storage.initialize_replica(fid).await.unwrap();

    let payload = Bytes::from_static(b"0123456789012345678901234567890123456789012345678901234");
    assert_eq!(payload.len(), 57);
    let mut hasher = HashComputer::new(Algorithm::Keyed64);
    hasher.update(&payload);
    let hash = hasher.hash();

    // Offset 40 is wrong; the replica expects 0 (nothing appended yet).
    let err = storage
        .replicate_into(fid, 40, payload.clone(), &hash)
        .await
        .unwrap_err();
    assert!(matches!(err, BlobbyError::OffsetMismatch { expected: 0, actual: 40 }));

    // The replica is now permanently Failed: even a correctly-addressed retry is rejected.
    let err = storage.replicate_into(fid, 0, payload, &hash).await.unwrap_err();
    assert!(matches!(err, BlobbyError::WrongReplicaState { .. }));

    storage.stop().await;
}
