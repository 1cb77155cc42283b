//! Streaming upload of a sealed spool file to the object store, with content-checksum
//! verification.

use bytes::Bytes;
use md5::{Digest, Md5};
use snafu::{ResultExt as _, Snafu};
use tokio::io::AsyncReadExt as _;

use crate::object_store::{ObjectStore, ObjectStoreError};

#[derive(Debug, Snafu)]
pub enum UploadError {
    #[snafu(display("i/o error reading spool file to upload: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("object store error: {source}"))]
    ObjectStore { source: ObjectStoreError },

    #[snafu(display("uploaded object's ETag '{etag}' did not match content MD5 '{expected}'"))]
    EtagMismatch { etag: String, expected: String },
}

/// Opens `path`, streams it through MD5, and issues a single PUT to `store` at `key`.
///
/// The response `ETag` (already stripped of quotes by the `ObjectStore` implementation) MUST
/// equal the hex MD5 of the uploaded bytes; a mismatch fails the upload so the caller requeues.
/// Multipart is not required.
pub async fn upload_file(
    store: &dyn ObjectStore,
    path: &std::path::Path,
    key: &str,
) -> Result<(), UploadError> {
    let mut file = tokio::fs::File::open(path).await.context(IoSnafu)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.context(IoSnafu)?;

    let mut hasher = Md5::new();
    hasher.update(&buf);
    let digest = hasher.finalize();
    let content_md5_b64 = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        digest.as_slice(),
    );
    let expected_hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();

    let etag = store
        .put(key, Bytes::from(buf), &content_md5_b64)
        .await
        .context(ObjectStoreSnafu)?;

    if etag != expected_hex {
        return Err(UploadError::EtagMismatch {
            etag,
            expected: expected_hex,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeStore {
        last_put: Mutex<Option<(String, Bytes, String)>>,
        reply_etag: String,
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn put(
            &self,
            key: &str,
            body: Bytes,
            content_md5_b64: &str,
        ) -> Result<String, ObjectStoreError> {
            *self.last_put.lock().unwrap() =
                Some((key.to_string(), body, content_md5_b64.to_string()));
            Ok(self.reply_etag.clone())
        }

        async fn get_range(
            &self,
            _key: &str,
            _start: u64,
            _length: u64,
        ) -> Result<Bytes, ObjectStoreError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn succeeds_when_etag_matches_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool-file");
        tokio::fs::write(&path, b"ABCDEFGHIJ").await.unwrap();

        let mut hasher = Md5::new();
        hasher.update(b"ABCDEFGHIJ");
        let expected_hex = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();

        let store = FakeStore {
            last_put: Mutex::new(None),
            reply_etag: expected_hex,
        };

        upload_file(&store, &path, "some/key").await.unwrap();
        let put = store.last_put.lock().unwrap();
        assert_eq!(put.as_ref().unwrap().0, "some/key");
    }

    #[tokio::test]
    async fn fails_when_etag_does_not_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool-file");
        tokio::fs::write(&path, b"ABCDEFGHIJ").await.unwrap();

        let store = FakeStore {
            last_put: Mutex::new(None),
            reply_etag: "deadbeef".to_string(),
        };

        let err = upload_file(&store, &path, "some/key").await.unwrap_err();
        assert!(matches!(err, UploadError::EtagMismatch { .. }));
    }
}
