//! The observable error kinds the engine distinguishes.
//!
//! `Insert` surfaces these to the caller with fidelity. Compression/upload/delete errors never
//! reach a caller: they're logged, metered, and the owning state machine requeues the task (see
//! `primary.rs`/`replica.rs`).

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BlobbyError {
    #[snafu(display("malformed id token: {source}"))]
    InvalidId { source: blobby_common::IdTokenError },

    #[snafu(display("record not found"))]
    NotFound,

    #[snafu(display("ranged read not possible against a compressed object"))]
    NotPossible,

    #[snafu(display("replica for fid {fid} not found on this node"))]
    ReplicaNotFound { fid: String },

    #[snafu(display("primary for fid {fid} not found on this node"))]
    PrimaryNotFound { fid: String },

    #[snafu(display("replica cannot accept this operation from state {state}"))]
    WrongReplicaState { state: &'static str },

    #[snafu(display("short read: expected {expected} bytes, got {actual}"))]
    ShortRead { expected: u64, actual: u64 },

    #[snafu(display("offset mismatch: expected {expected}, got {actual}"))]
    OffsetMismatch { expected: u64, actual: u64 },

    #[snafu(display("hash mismatch validating payload"))]
    HashMismatch,

    #[snafu(display("peer {machine_id} unreachable: {reason}"))]
    PeerUnreachable { machine_id: u32, reason: String },

    #[snafu(display("i/o error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("object store error: {source}"))]
    ObjectStore {
        source: crate::object_store::ObjectStoreError,
    },
}

pub type Result<T, E = BlobbyError> = std::result::Result<T, E>;
