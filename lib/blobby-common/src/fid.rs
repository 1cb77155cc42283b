use std::sync::atomic::{AtomicU16, Ordering};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use snafu::{ResultExt as _, Snafu};

use crate::clock::Clock;

/// Length, in bytes, of an encoded [`FileId`].
pub const FILE_ID_LEN: usize = 10;

/// Canonical string length of a base64url(no-pad)-encoded [`FileId`].
pub const FILE_ID_STR_LEN: usize = 14;

/// A 10-byte file identifier: `(epoch_seconds: u32, counter: u16, machine_id: u32)`.
///
/// FIDs sort lexicographically by creation time for a given machine, but carry no other
/// ordering guarantee across machines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    epoch_seconds: u32,
    counter: u16,
    machine_id: u32,
}

/// Errors that can occur decoding a [`FileId`] from its wire or string form.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum FileIdError {
    #[snafu(display("file id must be exactly {FILE_ID_LEN} bytes, got {len}"))]
    WrongLength { len: usize },

    #[snafu(display("file id was not valid base64url: {source}"))]
    Base64 { source: base64::DecodeError },
}

impl FileId {
    /// Builds a [`FileId`] from its three logical fields.
    #[must_use]
    pub fn new(epoch_seconds: u32, counter: u16, machine_id: u32) -> Self {
        Self {
            epoch_seconds,
            counter,
            machine_id,
        }
    }

    #[must_use]
    pub fn epoch_seconds(&self) -> u32 {
        self.epoch_seconds
    }

    #[must_use]
    pub fn counter(&self) -> u16 {
        self.counter
    }

    #[must_use]
    pub fn machine_id(&self) -> u32 {
        self.machine_id
    }

    /// Encodes this FID into its canonical 10-byte wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; FILE_ID_LEN] {
        let mut buf = [0u8; FILE_ID_LEN];
        buf[0..4].copy_from_slice(&self.epoch_seconds.to_be_bytes());
        buf[4..6].copy_from_slice(&self.counter.to_be_bytes());
        buf[6..10].copy_from_slice(&self.machine_id.to_be_bytes());
        buf
    }

    /// Decodes a [`FileId`] from its canonical 10-byte wire form.
    ///
    /// # Errors
    ///
    /// Returns [`FileIdError::WrongLength`] if `bytes` is not exactly [`FILE_ID_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FileIdError> {
        if bytes.len() != FILE_ID_LEN {
            return Err(FileIdError::WrongLength { len: bytes.len() });
        }

        let epoch_seconds = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let counter = u16::from_be_bytes(bytes[4..6].try_into().unwrap());
        let machine_id = u32::from_be_bytes(bytes[6..10].try_into().unwrap());

        Ok(Self {
            epoch_seconds,
            counter,
            machine_id,
        })
    }

    /// Renders this FID as URL-safe, unpadded base64 (always [`FILE_ID_STR_LEN`] characters).
    #[must_use]
    pub fn to_string_id(self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    /// Parses a FID from its base64url string form.
    ///
    /// # Errors
    ///
    /// Returns [`FileIdError::Base64`] on malformed base64, or [`FileIdError::WrongLength`] if the
    /// decoded payload isn't exactly [`FILE_ID_LEN`] bytes.
    pub fn from_string_id(s: &str) -> Result<Self, FileIdError> {
        let bytes = URL_SAFE_NO_PAD.decode(s).context(Base64Snafu)?;
        Self::from_bytes(&bytes)
    }
}

/// Mints process-unique [`FileId`]s for a single owning machine id.
///
/// The counter is a 16-bit value that wraps on overflow rather than erroring: minting more than
/// `u16::MAX` FIDs within the same wall-clock second on the same machine id is the only case that
/// can produce a duplicate, and is considered acceptable collision risk rather than a condition
/// worth failing inserts over.
pub struct FidMinter {
    machine_id: u32,
    counter: AtomicU16,
    clock: std::sync::Arc<dyn Clock>,
}

impl FidMinter {
    #[must_use]
    pub fn new(machine_id: u32, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            machine_id,
            counter: AtomicU16::new(0),
            clock,
        }
    }

    #[must_use]
    pub fn machine_id(&self) -> u32 {
        self.machine_id
    }

    /// Mints the next [`FileId`], advancing the process-local counter.
    #[must_use]
    pub fn mint(&self) -> FileId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let epoch_seconds = self.clock.now_unix().as_secs() as u32;
        FileId::new(epoch_seconds, counter, self.machine_id)
    }
}
