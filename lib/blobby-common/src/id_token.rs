//! The per-record identifier returned from `Insert`: a [`FileId`] plus a byte range.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use snafu::{ResultExt as _, Snafu};

use crate::fid::{FileId, FileIdError, FILE_ID_LEN};

/// Binary length of the long form: FID (10) + start (8) + length (4).
const LONG_FORM_LEN: usize = FILE_ID_LEN + 8 + 4;
/// Binary length of the short form: FID (10) + start (4) + length (4).
const SHORT_FORM_LEN: usize = FILE_ID_LEN + 4 + 4;

/// A decoded identifier for a single record: which file it lives in, and its byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdToken {
    pub fid: FileId,
    pub start: u64,
    pub length: u32,
}

/// Errors decoding an [`IdToken`] from its string form.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum IdTokenError {
    #[snafu(display("id token was not valid base64url: {source}"))]
    Base64 { source: base64::DecodeError },

    #[snafu(display(
        "id token must decode to {SHORT_FORM_LEN} or {LONG_FORM_LEN} bytes, got {len}"
    ))]
    WrongLength { len: usize },

    #[snafu(display("id token carried an invalid file id: {source}"))]
    Fid { source: FileIdError },
}

impl IdToken {
    #[must_use]
    pub fn new(fid: FileId, start: u64, length: u32) -> Self {
        Self { fid, start, length }
    }

    /// Encodes using the long form (8-byte start) when `start` doesn't fit in 32 bits, otherwise
    /// prefers the shorter, 4-byte-start form.
    #[must_use]
    pub fn encode(self) -> String {
        let mut buf = Vec::with_capacity(LONG_FORM_LEN);
        buf.extend_from_slice(&self.fid.to_bytes());

        if self.start > u64::from(u32::MAX) {
            buf.extend_from_slice(&self.start.to_be_bytes());
        } else {
            buf.extend_from_slice(&(self.start as u32).to_be_bytes());
        }
        buf.extend_from_slice(&self.length.to_be_bytes());

        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Forces encoding using the long (8-byte start) form, regardless of `start`'s magnitude.
    #[must_use]
    pub fn encode_long(self) -> String {
        let mut buf = Vec::with_capacity(LONG_FORM_LEN);
        buf.extend_from_slice(&self.fid.to_bytes());
        buf.extend_from_slice(&self.start.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Decodes an [`IdToken`] from its base64url string form, choosing the long or short binary
    /// layout based on the decoded length.
    ///
    /// # Errors
    ///
    /// Returns an error if the string isn't valid base64url, if the decoded length is neither the
    /// long nor short form length, or if the embedded FID is malformed.
    pub fn decode(s: &str) -> Result<Self, IdTokenError> {
        let bytes = URL_SAFE_NO_PAD.decode(s).context(Base64Snafu)?;

        let fid_bytes = bytes.get(0..FILE_ID_LEN).ok_or(IdTokenError::WrongLength {
            len: bytes.len(),
        })?;
        let fid = FileId::from_bytes(fid_bytes).context(FidSnafu)?;

        match bytes.len() {
            LONG_FORM_LEN => {
                let start = u64::from_be_bytes(bytes[10..18].try_into().unwrap());
                let length = u32::from_be_bytes(bytes[18..22].try_into().unwrap());
                Ok(Self { fid, start, length })
            }
            SHORT_FORM_LEN => {
                let start = u32::from_be_bytes(bytes[10..14].try_into().unwrap());
                let length = u32::from_be_bytes(bytes[14..18].try_into().unwrap());
                Ok(Self {
                    fid,
                    start: u64::from(start),
                    length,
                })
            }
            len => Err(IdTokenError::WrongLength { len }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_short_form() {
        let fid = FileId::new(1_700_000_000, 1, 1);
        let token = IdToken::new(fid, 0, 10);
        let encoded = token.encode();
        assert_eq!(IdToken::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn round_trips_long_form() {
        let fid = FileId::new(1_700_000_000, 1, 1);
        let token = IdToken::new(fid, u64::from(u32::MAX) + 100, 10);
        let encoded = token.encode();
        assert_eq!(IdToken::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn forced_long_form_round_trips_small_start() {
        let fid = FileId::new(1_700_000_000, 1, 1);
        let token = IdToken::new(fid, 0, 10);
        let encoded = token.encode_long();
        assert_eq!(IdToken::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn rejects_bad_length() {
        let s = URL_SAFE_NO_PAD.encode([0u8; 5]);
        assert!(matches!(
            IdToken::decode(&s),
            Err(IdTokenError::WrongLength { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_round_trip(epoch in 0u32.., counter in 0u16.., machine in 0u32.., start in 0u64.., length in 0u32..) {
            let fid = FileId::new(epoch, counter, machine);
            let token = IdToken::new(fid, start, length);
            let decoded = IdToken::decode(&token.encode()).unwrap();
            proptest::prop_assert_eq!(decoded, token);
        }
    }
}
