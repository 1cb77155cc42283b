//! A thin `axum` front-end translating the peer/client wire contract onto
//! [`Storage`] calls.
//!
//! This is a contract surface only: no authentication, no TLS termination, no CIDR filtering, no
//! Prometheus rendering — those stay external collaborators. Because none of the five verbs this
//! engine needs (`INITIALIZE`, `HEARTBEAT`, `REPLICATE`, `DELETE`, `GET`) beyond `GET` are
//! standard HTTP methods with a matching [`axum::routing::MethodFilter`], every request to
//! `/:namespace/:id` is routed through a single handler that dispatches on [`http::Method`].

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use blobby_common::{FileId, IdToken};
use tracing::warn;

use crate::{error::BlobbyError, namespace::Storage};

/// Maps a namespace name to the [`Storage`] instance hosting it. A single `blobbyd` process may
/// host several independently-configured namespaces, each on its own `Storage`.
#[derive(Clone)]
pub struct AppState {
    pub namespaces: Arc<HashMap<String, Arc<Storage>>>,
}

impl AppState {
    #[must_use]
    pub fn new(namespaces: HashMap<String, Arc<Storage>>) -> Self {
        Self {
            namespaces: Arc::new(namespaces),
        }
    }
}

/// Builds the router: a single catch-all route's `/<ns>/<fid-or-id-token>` path
/// shape, dispatching on method since most of these verbs have no `axum` `MethodFilter`.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/:namespace/:id", any(dispatch))
        .with_state(state)
}

async fn dispatch(
    State(state): State<AppState>,
    Path((namespace, id)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(storage) = state.namespaces.get(&namespace).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown namespace").into_response();
    };

    match method.as_str() {
        "INITIALIZE" => initialize(storage, &id).await,
        "HEARTBEAT" => heartbeat(&storage, &id).await,
        "REPLICATE" => replicate(storage, &id, &headers, body).await,
        "DELETE" => delete(&storage, &id).await,
        "GET" => get(storage, &id, &headers).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

fn parse_fid(id: &str) -> Result<FileId, Response> {
    FileId::from_string_id(id)
        .map_err(|_| (StatusCode::BAD_REQUEST, "malformed fid").into_response())
}

async fn initialize(storage: Arc<Storage>, id: &str) -> Response {
    let fid = match parse_fid(id) {
        Ok(fid) => fid,
        Err(resp) => return resp,
    };
    match storage.initialize_replica(fid).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(&error),
    }
}

async fn heartbeat(storage: &Storage, id: &str) -> Response {
    let fid = match parse_fid(id) {
        Ok(fid) => fid,
        Err(resp) => return resp,
    };
    match storage.heart_beat(fid) {
        Ok(shutting_down) => {
            let mut resp = StatusCode::NO_CONTENT.into_response();
            set_shutting_down_header(&mut resp, shutting_down);
            resp
        }
        Err(error) => error_response(&error),
    }
}

async fn replicate(storage: Arc<Storage>, id: &str, headers: &HeaderMap, body: Bytes) -> Response {
    let fid = match parse_fid(id) {
        Ok(fid) => fid,
        Err(resp) => return resp,
    };
    let Some(start) = header_u64(headers, "Start") else {
        return (StatusCode::BAD_REQUEST, "missing or malformed Start header").into_response();
    };
    let Some(end) = header_u64(headers, "End") else {
        return (StatusCode::BAD_REQUEST, "missing or malformed End header").into_response();
    };
    let Some(hash) = headers.get("Hash").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing Hash header").into_response();
    };
    if end.saturating_sub(start) != body.len() as u64 {
        return (
            StatusCode::BAD_REQUEST,
            "End - Start does not match the advertised body length",
        )
            .into_response();
    }

    match storage.replicate_into(fid, start, body, hash).await {
        Ok(shutting_down) => {
            let mut resp = StatusCode::NO_CONTENT.into_response();
            set_shutting_down_header(&mut resp, shutting_down);
            resp
        }
        Err(error) => error_response(&error),
    }
}

async fn delete(storage: &Storage, id: &str) -> Response {
    let fid = match parse_fid(id) {
        Ok(fid) => fid,
        Err(resp) => return resp,
    };
    match storage.queue_delete(fid) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(&error),
    }
}

async fn get(storage: Arc<Storage>, id: &str, headers: &HeaderMap) -> Response {
    let token = match IdToken::decode(id) {
        Ok(token) => token,
        Err(source) => return error_response(&BlobbyError::InvalidId { source }),
    };
    let local_only = headers
        .get("Blobby-Local-Only")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    match storage.read(token, local_only).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(BlobbyError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(error) => error_response(&error),
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn set_shutting_down_header(resp: &mut Response, shutting_down: bool) {
    if let Ok(value) = HeaderValue::from_str(if shutting_down { "true" } else { "false" }) {
        resp.headers_mut().insert("Shutting-Down", value);
    }
}

/// Maps a [`BlobbyError`] onto a status code. The wire contract only distinguishes
/// success/4xx/5xx at the wire level; the specific kind is logged for operators but not
/// round-tripped to the client beyond what the status conveys.
fn error_response(error: &BlobbyError) -> Response {
    let status = match error {
        BlobbyError::InvalidId { .. } => StatusCode::BAD_REQUEST,
        BlobbyError::NotFound => StatusCode::NOT_FOUND,
        BlobbyError::NotPossible => StatusCode::UNPROCESSABLE_ENTITY,
        BlobbyError::ReplicaNotFound { .. } | BlobbyError::PrimaryNotFound { .. } => StatusCode::NOT_FOUND,
        BlobbyError::WrongReplicaState { .. } => StatusCode::CONFLICT,
        BlobbyError::ShortRead { .. } | BlobbyError::OffsetMismatch { .. } => StatusCode::BAD_REQUEST,
        BlobbyError::HashMismatch => StatusCode::BAD_REQUEST,
        BlobbyError::PeerUnreachable { .. } => StatusCode::BAD_GATEWAY,
        BlobbyError::Io { .. } | BlobbyError::ObjectStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(%error, "request failed");
    }
    (status, error.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_shared;
    use axum::body::Body;
    use blobby_common::FileId;
    use tower::ServiceExt as _;

    async fn test_storage() -> Arc<Storage> {
        let (shared, _dir) = test_shared().await;
        let storage = Storage::new(shared);
        storage.start().await.unwrap();
        storage
    }

    fn app(storage: Arc<Storage>) -> Router {
        let mut namespaces = HashMap::new();
        namespaces.insert("test-ns".to_string(), storage);
        router(AppState::new(namespaces))
    }

    #[tokio::test]
    async fn initialize_then_heartbeat_round_trips() {
        let storage = test_storage().await;
        let fid = FileId::new(1_700_000_000, 1, 1);
        let router = app(storage);

        let req = axum::http::Request::builder()
            .method("INITIALIZE")
            .uri(format!("/test-ns/{}", fid.to_string_id()))
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let req = axum::http::Request::builder()
            .method("HEARTBEAT")
            .uri(format!("/test-ns/{}", fid.to_string_id()))
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn get_unknown_token_returns_404() {
        let storage = test_storage().await;
        let router = app(storage);
        let fid = FileId::new(1_700_000_000, 9, 1);
        let token = IdToken::new(fid, 0, 10).encode();

        let req = axum::http::Request::builder()
            .method("GET")
            .uri(format!("/test-ns/{token}"))
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_namespace_returns_404() {
        let storage = test_storage().await;
        let router = app(storage);
        let req = axum::http::Request::builder()
            .method("GET")
            .uri("/no-such-ns/AAAA")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
