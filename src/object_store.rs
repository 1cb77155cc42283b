//! The object-store client behind a narrow trait, so the engine depends on a capability rather
//! than directly on `aws-sdk-s3` everywhere it needs cold storage.

use async_trait::async_trait;
use aws_sdk_s3::{primitives::ByteStream, Client};
use bytes::Bytes;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum ObjectStoreError {
    #[snafu(display("object store PUT failed: {source}"))]
    Put {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("object store GET failed: {source}"))]
    Get {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("GetObject returned Content-Length {actual}, expected {expected}"))]
    RangeLengthMismatch { expected: u64, actual: u64 },
}

/// A streaming PUT with an expected MD5 (base64) for `Content-MD5`, and a ranged GET, which is
/// all the uploader and read resolver need from cold storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the response ETag (already stripped of surrounding quotes).
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_md5_b64: &str,
    ) -> Result<String, ObjectStoreError>;

    /// Issues a ranged `GetObject` for `[start, start+length)`. The returned buffer's length
    /// MUST equal `length`, which the caller has already validated is what the object holds;
    /// implementations should surface [`ObjectStoreError::RangeLengthMismatch`] if the store
    /// disagrees.
    async fn get_range(&self, key: &str, start: u64, length: u64) -> Result<Bytes, ObjectStoreError>;
}

/// An [`ObjectStore`] backed by a real S3-compatible endpoint.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    #[must_use]
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_md5_b64: &str,
    ) -> Result<String, ObjectStoreError> {
        let len = body.len() as i64;
        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .content_length(len)
            .content_md5(content_md5_b64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Put {
                source: Box::new(e),
            })?;

        Ok(resp
            .e_tag()
            .unwrap_or_default()
            .trim_matches('"')
            .to_string())
    }

    async fn get_range(&self, key: &str, start: u64, length: u64) -> Result<Bytes, ObjectStoreError> {
        let end = start + length - 1;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Get {
                source: Box::new(e),
            })?;

        if let Some(content_length) = resp.content_length() {
            if content_length as u64 != length {
                return Err(ObjectStoreError::RangeLengthMismatch {
                    expected: length,
                    actual: content_length as u64,
                });
            }
        }

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Get {
                source: Box::new(e),
            })?
            .into_bytes();
        Ok(bytes)
    }
}
