//! Cross-cutting dependencies every `Primary`/`Replica` needs: the clock, the timer facility,
//! the background work queues, the object store, and the compiled key template. Bundled into one
//! `Arc` so entity constructors don't grow a dozen individual dependency parameters.

use std::{path::PathBuf, sync::Arc};

use blobby_common::Clock;
use blobby_buffers::{DelayQueue, WorkQueue};
use blobby_keyfmt::KeyTemplate;

use crate::{config::Settings, metrics::NamespaceMetrics, object_store::ObjectStore, remote::Remote};

/// Dependencies shared by every primary and replica within one namespace.
pub struct Shared {
    pub namespace: String,
    pub settings: Arc<Settings>,
    pub clock: Arc<dyn Clock>,
    pub delay_queue: DelayQueue,
    pub compress_queue: WorkQueue,
    pub upload_queue: WorkQueue,
    pub delete_local_queue: WorkQueue,
    pub delete_remotes_queue: WorkQueue,
    pub object_store: Arc<dyn ObjectStore>,
    pub key_template: KeyTemplate,
    pub metrics: NamespaceMetrics,
    pub remotes: Vec<Arc<dyn Remote>>,
    pub shutting_down: Arc<std::sync::atomic::AtomicBool>,
}

impl Shared {
    #[must_use]
    pub fn spool_path(&self, file_name: &str) -> PathBuf {
        self.settings.spool_dir.join(file_name)
    }

    #[must_use]
    pub fn object_key(&self, epoch_seconds: u32, counter: u16, machine_id: u32) -> String {
        let formatted = self.key_template.format(epoch_seconds, counter, machine_id);
        if self.settings.key_prefix.is_empty() {
            formatted
        } else {
            format!("{}/{}", self.settings.key_prefix.trim_end_matches('/'), formatted)
        }
    }
}
