//! Per-namespace metrics, registered through the `metrics` facade: a small struct of pre-built
//! handles rather than macro calls with string labels scattered through the state machines.

use metrics::{Counter, Gauge, Histogram};

/// Metrics for a single namespace's storage engine.
#[derive(Clone)]
pub struct NamespaceMetrics {
    pub appendable_primaries: Gauge,
    pub open_replicas: Gauge,
    pub waiters: Gauge,

    pub inserts_total: Counter,
    pub insert_bytes_total: Counter,
    pub insert_errors_total: Counter,
    pub insert_duration: Histogram,

    pub replicate_errors_total: Counter,
    pub replicate_duration: Histogram,

    pub uploads_total: Counter,
    pub upload_errors_total: Counter,
    pub upload_duration: Histogram,

    pub deletes_total: Counter,
    pub delete_errors_total: Counter,

    pub heartbeat_failures_total: Counter,
    pub sealed_total: Counter,
}

impl NamespaceMetrics {
    #[must_use]
    pub fn new(namespace: &str) -> Self {
        let ns = namespace.to_string();
        Self {
            appendable_primaries: metrics::gauge!("blobby_appendable_primaries", "namespace" => ns.clone()),
            open_replicas: metrics::gauge!("blobby_open_replicas", "namespace" => ns.clone()),
            waiters: metrics::gauge!("blobby_waiters", "namespace" => ns.clone()),

            inserts_total: metrics::counter!("blobby_inserts_total", "namespace" => ns.clone()),
            insert_bytes_total: metrics::counter!("blobby_insert_bytes_total", "namespace" => ns.clone()),
            insert_errors_total: metrics::counter!("blobby_insert_errors_total", "namespace" => ns.clone()),
            insert_duration: metrics::histogram!("blobby_insert_duration_seconds", "namespace" => ns.clone()),

            replicate_errors_total: metrics::counter!("blobby_replicate_errors_total", "namespace" => ns.clone()),
            replicate_duration: metrics::histogram!("blobby_replicate_duration_seconds", "namespace" => ns.clone()),

            uploads_total: metrics::counter!("blobby_uploads_total", "namespace" => ns.clone()),
            upload_errors_total: metrics::counter!("blobby_upload_errors_total", "namespace" => ns.clone()),
            upload_duration: metrics::histogram!("blobby_upload_duration_seconds", "namespace" => ns.clone()),

            deletes_total: metrics::counter!("blobby_deletes_total", "namespace" => ns.clone()),
            delete_errors_total: metrics::counter!("blobby_delete_errors_total", "namespace" => ns.clone()),

            heartbeat_failures_total: metrics::counter!("blobby_heartbeat_failures_total", "namespace" => ns.clone()),
            sealed_total: metrics::counter!("blobby_sealed_total", "namespace" => ns),
        }
    }
}
