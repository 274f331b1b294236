//! Streaming digest used to detect no-op denormalizations.
//!
//! The denormalizer hashes the cached copy of a document, rebuilds the
//! document, and hashes the rebuilt encoding as it streams into the
//! output buffer. Equal digests mean the bytes are identical, so the
//! cache write and any upward edge re-enqueue can be skipped. This is
//! the primary defense against denormalization feedback loops, and it
//! only works because the encoding is deterministic (struct field order,
//! no map iteration).

use std::io::{self, Write};

/// A content digest of a serialized document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Etag(blake3::Hash);

impl Etag {
    /// Digest a complete byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        Etag(blake3::hash(bytes))
    }

    /// Hex form, for logging.
    pub fn to_hex(self) -> String {
        self.0.to_hex().to_string()
    }
}

/// A writer that tees everything into a hasher while forwarding to the
/// inner writer.
pub struct EtagWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
}

impl<W: Write> EtagWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
        }
    }

    /// Consume the writer, returning the inner writer and the digest of
    /// everything written through it.
    pub fn finish(self) -> (W, Etag) {
        (self.inner, Etag(self.hasher.finalize()))
    }
}

impl<W: Write> Write for EtagWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_matches_slice_digest() {
        let payload = br#"{"ForeignId":1,"Books":[]}"#;

        let mut writer = EtagWriter::new(Vec::new());
        writer.write_all(payload).unwrap();
        let (buf, etag) = writer.finish();

        assert_eq!(buf, payload);
        assert_eq!(etag, Etag::of(payload));
    }

    #[test]
    fn test_chunked_writes_equal_one_shot() {
        let mut writer = EtagWriter::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (_, chunked) = writer.finish();

        assert_eq!(chunked, Etag::of(b"hello world"));
    }

    #[test]
    fn test_different_bytes_differ() {
        assert_ne!(Etag::of(b"a"), Etag::of(b"b"));
    }
}
