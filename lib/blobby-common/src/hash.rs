//! Streaming checksums used to verify appends and replicated payloads on the wire.
//!
//! Two algorithms are supported: a fast keyed 64-bit hash (HighwayHash, keyed with a fixed
//! process-wide constant) used for the hot append/replicate path, and MD5, used where the
//! consumer on the other end (the object store's `ETag`) only understands MD5. Both serialize to
//! the same `"<algo>=<base64url-no-pad>"` shape.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use highway::{HighwayHash, HighwayHasher, Key};
use md5::{Digest, Md5};
use snafu::Snafu;

/// The fixed, process-wide HighwayHash key. Not a secret: its only job is to keep the hash
/// stable across restarts of this engine while differing from HighwayHash's published test
/// vectors, so an operator can't confuse our checksums with a third party's.
const HIGHWAY_KEY: Key = Key([
    0x0123_4567_89ab_cdef,
    0xfedc_ba98_7654_3210,
    0x0f1e_2d3c_4b5a_6978,
    0x8796_a5b4_c3d2_e1f0,
]);

const ALGO_KEYED64: &str = "hw64";
const ALGO_MD5: &str = "md5";

/// A supported checksum algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Keyed 64-bit HighwayHash; used for the hot append/replicate path.
    Keyed64,
    /// MD5; used where the peer on the other end expects it (e.g. object-store `ETag`).
    Md5,
}

impl Algorithm {
    fn tag(self) -> &'static str {
        match self {
            Algorithm::Keyed64 => ALGO_KEYED64,
            Algorithm::Md5 => ALGO_MD5,
        }
    }
}

enum State {
    Keyed64(Box<HighwayHasher>),
    Md5(Box<Md5>),
}

/// Accumulates a checksum over a stream of bytes without buffering them.
pub struct HashComputer {
    algo: Algorithm,
    state: State,
}

impl HashComputer {
    #[must_use]
    pub fn new(algo: Algorithm) -> Self {
        let state = match algo {
            Algorithm::Keyed64 => State::Keyed64(Box::new(HighwayHasher::new(HIGHWAY_KEY))),
            Algorithm::Md5 => State::Md5(Box::new(Md5::new())),
        };
        Self { algo, state }
    }

    /// Feeds another chunk of bytes into the running digest.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            State::Keyed64(h) => h.append(data),
            State::Md5(h) => h.update(data),
        }
    }

    /// Finalizes and renders the digest as `"<algo>=<base64url-no-pad>"`.
    ///
    /// Finalizing consumes the accumulator, mirroring that a digest, once read, cannot accept
    /// further writes.
    #[must_use]
    pub fn hash(self) -> String {
        let raw: Vec<u8> = match self.state {
            State::Keyed64(h) => h.finalize64().to_be_bytes().to_vec(),
            State::Md5(h) => h.finalize().to_vec(),
        };
        format!("{}={}", self.algo.tag(), URL_SAFE_NO_PAD.encode(raw))
    }

    /// Raw, un-encoded digest bytes, finalizing the accumulator. Used by the uploader, which
    /// needs MD5 bytes for the `Content-MD5` header rather than our `"algo=..."` string form.
    #[must_use]
    pub fn finalize_raw(self) -> Vec<u8> {
        match self.state {
            State::Keyed64(h) => h.finalize64().to_be_bytes().to_vec(),
            State::Md5(h) => h.finalize().to_vec(),
        }
    }
}

/// Errors parsing a serialized hash string (`"<algo>=<base64url>"`).
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum HashParseError {
    #[snafu(display("hash string '{value}' has no '=' separator"))]
    MissingSeparator { value: String },

    #[snafu(display("unknown hash algorithm '{algo}'"))]
    UnknownAlgorithm { algo: String },

    #[snafu(display("hash payload was not valid base64url: {source}"))]
    Base64 { source: base64::DecodeError },
}

/// Verifies a stream of bytes against a previously-advertised hash string, without buffering the
/// stream: replicas use this to validate an incoming append as it's written to disk.
pub struct HashValidator {
    expected_algo: Algorithm,
    expected_digest: Vec<u8>,
    computer: HashComputer,
}

impl HashValidator {
    /// Parses `expected` (e.g. `"hw64=abc123"`) and prepares to validate a stream against it.
    ///
    /// # Errors
    ///
    /// Returns [`HashParseError`] if `expected` isn't a well-formed `"<algo>=<base64url>"` string.
    pub fn new(expected: &str) -> Result<Self, HashParseError> {
        let (algo_str, payload) =
            expected
                .split_once('=')
                .ok_or_else(|| HashParseError::MissingSeparator {
                    value: expected.to_string(),
                })?;

        let algo = match algo_str {
            ALGO_KEYED64 => Algorithm::Keyed64,
            ALGO_MD5 => Algorithm::Md5,
            other => {
                return Err(HashParseError::UnknownAlgorithm {
                    algo: other.to_string(),
                })
            }
        };

        let expected_digest = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|source| HashParseError::Base64 { source })?;

        Ok(Self {
            expected_algo: algo,
            expected_digest,
            computer: HashComputer::new(algo),
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.computer.update(data);
    }

    /// Finalizes the running digest and compares it against the expected value.
    #[must_use]
    pub fn check(self) -> bool {
        let algo = self.expected_algo;
        let actual = self.computer.finalize_raw();
        algo == self.expected_algo && actual == self.expected_digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed64_round_trips_through_validator() {
        let mut computer = HashComputer::new(Algorithm::Keyed64);
        computer.update(b"hello ");
        computer.update(b"world");
        let serialized = computer.hash();
        assert!(serialized.starts_with("hw64="));

        let mut validator = HashValidator::new(&serialized).unwrap();
        validator.update(b"hello world");
        assert!(validator.check());
    }

    #[test]
    fn md5_round_trips_through_validator() {
        let mut computer = HashComputer::new(Algorithm::Md5);
        computer.update(b"ABCDEFGHIJ");
        let serialized = computer.hash();
        assert!(serialized.starts_with("md5="));

        let mut validator = HashValidator::new(&serialized).unwrap();
        validator.update(b"ABCDEFGHIJ");
        assert!(validator.check());
    }

    #[test]
    fn validator_rejects_tampered_payload() {
        let mut computer = HashComputer::new(Algorithm::Keyed64);
        computer.update(b"original");
        let serialized = computer.hash();

        let mut validator = HashValidator::new(&serialized).unwrap();
        validator.update(b"tampered!");
        assert!(!validator.check());
    }

    #[test]
    fn rejects_malformed_hash_string() {
        assert!(matches!(
            HashValidator::new("not-a-hash"),
            Err(HashParseError::MissingSeparator { .. })
        ));
        assert!(matches!(
            HashValidator::new("bogus=AAAA"),
            Err(HashParseError::UnknownAlgorithm { .. })
        ));
    }
}
