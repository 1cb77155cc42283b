//! The blobby storage engine: a namespaced, append-only blob buffer that stages writes to a
//! local spool, replicates them synchronously to a peer quorum, and eventually migrates sealed
//! spools to an object store.
//!
//! This crate is the core: the primary/replica state machines, the namespace that owns them,
//! the read resolver, and the uploader/remote/object-store collaborators they depend on. The
//! TOML loader, HTTP auth layers, TLS termination, and Prometheus rendering are external
//! concerns; [`http`] wires the peer/client wire contract onto [`namespace::Storage`] as a thin,
//! auth-free `axum` router, and `src/bin/blobbyd.rs` is the minimal process that ties a
//! namespace to a real clock, object store, and peer set.

pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod namespace;
pub mod object_store;
pub mod primary;
pub mod reader;
pub mod remote;
pub mod replica;
pub mod shared;
mod test_support;
pub mod uploader;

pub use config::Settings;
pub use error::BlobbyError;
pub use namespace::Storage;
pub use shared::Shared;
