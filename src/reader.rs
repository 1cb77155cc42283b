//! The length-capped reader returned by every tier of the read resolver.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};

/// A byte stream bounded to an exact, already-validated length, regardless of which resolver
/// tier produced it (local file, peer RPC, or object-store `GetObject`).
pub enum ReadStream {
    File(tokio::io::Take<tokio::fs::File>),
    Memory(io::Cursor<Bytes>),
}

impl ReadStream {
    #[must_use]
    pub fn from_file(file: tokio::fs::File, length: u64) -> Self {
        use tokio::io::AsyncReadExt as _;
        Self::File(file.take(length))
    }

    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self::Memory(io::Cursor::new(bytes))
    }
}

impl AsyncRead for ReadStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ReadStream::File(f) => Pin::new(f).poll_read(cx, buf),
            ReadStream::Memory(c) => Pin::new(c).poll_read(cx, buf),
        }
    }
}

/// Reads the full contents of a [`ReadStream`] into memory. Used by the peer HTTP client and
/// integration tests, where the bounded length already caps the allocation.
pub async fn read_to_bytes(mut stream: ReadStream) -> io::Result<Bytes> {
    use tokio::io::AsyncReadExt as _;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}
