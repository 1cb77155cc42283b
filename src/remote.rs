//! The peer-facing `Remote` interface and an HTTP-based implementation of it over the wire
//! contract spoken between cluster peers.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{client::HttpConnector, Body, Client};
use snafu::{ResultExt as _, Snafu};

use blobby_common::{FileId, IdToken};

/// Errors talking to a peer. These never reach a caller directly; the primary
/// aggregates them into a per-peer failed flag and, for the aggregate case, a seal decision.
#[derive(Debug, Snafu)]
pub enum RemoteError {
    #[snafu(display("transport error talking to peer: {source}"))]
    Transport { source: hyper::Error },

    #[snafu(display("peer returned malformed response: {reason}"))]
    MalformedResponse { reason: String },

    #[snafu(display("peer returned status {status}"))]
    Status { status: u16 },

    #[snafu(display("peer does not host a replica for this fid"))]
    ReplicaNotFound,
}

/// Outcome of a `Replicate`/`HeartBeat` call: whether the peer is draining and will reject
/// further work ("surface a 'peer is draining' signal that causes the
/// primary to proactively seal").
pub type ShuttingDown = bool;

/// Polymorphic peer-facing operations; a concrete transport (here, HTTP) implements it against
/// the wire contract.
#[async_trait]
pub trait Remote: Send + Sync {
    fn machine_id(&self) -> u32;

    async fn initialize(&self, namespace: &str, fid: FileId) -> Result<(), RemoteError>;

    async fn heart_beat(&self, namespace: &str, fid: FileId) -> Result<ShuttingDown, RemoteError>;

    async fn replicate(
        &self,
        namespace: &str,
        fid: FileId,
        start: u64,
        data: Bytes,
        hash: &str,
    ) -> Result<ShuttingDown, RemoteError>;

    async fn delete(&self, namespace: &str, fid: FileId) -> Result<(), RemoteError>;

    /// `None` means the peer returned 404 (not found there); callers fall through to the next
    /// resolver tier rather than treating it as a transport failure.
    async fn read(
        &self,
        namespace: &str,
        token: IdToken,
        local_only: bool,
    ) -> Result<Option<Bytes>, RemoteError>;
}

/// An HTTP client implementing [`Remote`] against a single peer. Connections are pooled by
/// `hyper` per-peer with a large idle cap and a 90-second idle timeout.
pub struct HttpRemote {
    machine_id: u32,
    base_url: String,
    client: Client<HttpConnector>,
}

impl HttpRemote {
    #[must_use]
    pub fn new(machine_id: u32, base_url: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .build_http();
        Self {
            machine_id,
            base_url,
            client,
        }
    }

    fn uri(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn shutting_down_header(resp: &hyper::Response<Body>) -> bool {
    resp.headers()
        .get("Shutting-Down")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[async_trait]
impl Remote for HttpRemote {
    fn machine_id(&self) -> u32 {
        self.machine_id
    }

    async fn initialize(&self, namespace: &str, fid: FileId) -> Result<(), RemoteError> {
        let uri = self.uri(&format!("/{namespace}/{}", fid.to_string_id()));
        let req = hyper::Request::builder()
            .method("INITIALIZE")
            .uri(uri)
            .body(Body::empty())
            .map_err(|_| RemoteError::MalformedResponse {
                reason: "failed building request".to_string(),
            })?;
        let resp = self.client.request(req).await.context(TransportSnafu)?;
        if resp.status().as_u16() == 204 {
            Ok(())
        } else {
            Err(RemoteError::Status {
                status: resp.status().as_u16(),
            })
        }
    }

    async fn heart_beat(&self, namespace: &str, fid: FileId) -> Result<ShuttingDown, RemoteError> {
        let uri = self.uri(&format!("/{namespace}/{}", fid.to_string_id()));
        let req = hyper::Request::builder()
            .method("HEARTBEAT")
            .uri(uri)
            .body(Body::empty())
            .map_err(|_| RemoteError::MalformedResponse {
                reason: "failed building request".to_string(),
            })?;
        let resp = self.client.request(req).await.context(TransportSnafu)?;
        match resp.status().as_u16() {
            204 => Ok(shutting_down_header(&resp)),
            404 => Err(RemoteError::ReplicaNotFound),
            status => Err(RemoteError::Status { status }),
        }
    }

    async fn replicate(
        &self,
        namespace: &str,
        fid: FileId,
        start: u64,
        data: Bytes,
        hash: &str,
    ) -> Result<ShuttingDown, RemoteError> {
        let end = start + data.len() as u64;
        let uri = self.uri(&format!("/{namespace}/{}", fid.to_string_id()));
        let req = hyper::Request::builder()
            .method("REPLICATE")
            .uri(uri)
            .header("Start", start.to_string())
            .header("End", end.to_string())
            .header("Hash", hash)
            .body(Body::from(data))
            .map_err(|_| RemoteError::MalformedResponse {
                reason: "failed building request".to_string(),
            })?;
        let resp = self.client.request(req).await.context(TransportSnafu)?;
        match resp.status().as_u16() {
            204 => Ok(shutting_down_header(&resp)),
            404 => Err(RemoteError::ReplicaNotFound),
            status => Err(RemoteError::Status { status }),
        }
    }

    async fn delete(&self, namespace: &str, fid: FileId) -> Result<(), RemoteError> {
        let uri = self.uri(&format!("/{namespace}/{}", fid.to_string_id()));
        let req = hyper::Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .map_err(|_| RemoteError::MalformedResponse {
                reason: "failed building request".to_string(),
            })?;
        let resp = self.client.request(req).await.context(TransportSnafu)?;
        if resp.status().as_u16() == 204 {
            Ok(())
        } else {
            Err(RemoteError::Status {
                status: resp.status().as_u16(),
            })
        }
    }

    async fn read(
        &self,
        namespace: &str,
        token: IdToken,
        local_only: bool,
    ) -> Result<Option<Bytes>, RemoteError> {
        let uri = self.uri(&format!("/{namespace}/{}", token.encode()));
        let mut builder = hyper::Request::builder().method("GET").uri(uri);
        if local_only {
            builder = builder.header("Blobby-Local-Only", "true");
        }
        let req = builder
            .body(Body::empty())
            .map_err(|_| RemoteError::MalformedResponse {
                reason: "failed building request".to_string(),
            })?;
        let resp = self.client.request(req).await.context(TransportSnafu)?;
        match resp.status().as_u16() {
            200 => {
                let bytes = hyper::body::to_bytes(resp.into_body())
                    .await
                    .map_err(|source| RemoteError::Transport { source })?;
                Ok(Some(bytes))
            }
            404 => Ok(None),
            status => Err(RemoteError::Status { status }),
        }
    }
}
