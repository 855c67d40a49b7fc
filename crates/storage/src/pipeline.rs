//! Streaming checksum pipeline.
//!
//! Uploads pull bytes through a [`ChecksumReader`], which hashes and counts
//! everything it hands out. Downloads are wrapped with [`verify_stream`] so
//! corruption surfaces as an error at the end of the stream.

use crate::error::{StorageError, StorageResult};
use crate::traits::ByteStream;
use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use depot_core::{Checksum, ChecksumHasher};
use futures::{Stream, StreamExt};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// An owned, single-use source of image bytes.
pub struct ByteSource {
    stream: ByteStream,
}

impl ByteSource {
    /// A source over an in-memory buffer.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::from_stream(futures::stream::once(async move { Ok(data) }))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = StorageResult<Bytes>> + Send + 'static,
    {
        Self {
            stream: Box::pin(stream),
        }
    }

    /// A source over an async reader, e.g. an open file.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::from_stream(ReaderStream::new(reader).map(|r| r.map_err(StorageError::from)))
    }

    pub fn empty() -> Self {
        Self::from_stream(futures::stream::empty())
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
    }
}

impl From<Bytes> for ByteSource {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource").finish_non_exhaustive()
    }
}

/// Size and MD5 of everything read from a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadDigest {
    pub size: u64,
    pub checksum: Checksum,
}

/// Receives the digest of a stream produced by [`ChecksumReader::into_stream`].
///
/// The digest is only available once the stream has been read to the end.
#[derive(Clone, Debug, Default)]
pub struct DigestHandle(Arc<OnceLock<UploadDigest>>);

impl DigestHandle {
    pub fn get(&self) -> Option<UploadDigest> {
        self.0.get().copied()
    }
}

/// Hashes and counts bytes as they are pulled from a [`ByteSource`].
pub struct ChecksumReader {
    source: ByteStream,
    // Bytes pulled from the source but not yet handed out.
    pending: Bytes,
    hasher: ChecksumHasher,
    bytes_read: u64,
    exhausted: bool,
}

impl ChecksumReader {
    pub fn new(source: ByteSource) -> Self {
        Self {
            source: source.into_stream(),
            pending: Bytes::new(),
            hasher: Checksum::hasher(),
            bytes_read: 0,
            exhausted: false,
        }
    }

    /// Bytes handed out so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    async fn fill(&mut self) -> StorageResult<()> {
        while self.pending.is_empty() && !self.exhausted {
            match self.source.next().await {
                Some(piece) => self.pending = piece?,
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    /// Hand out at most `max` bytes, or `None` once the source is drained.
    pub async fn next_piece(&mut self, max: usize) -> StorageResult<Option<Bytes>> {
        self.fill().await?;
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = max.max(1).min(self.pending.len());
        let piece = self.pending.split_to(take);
        self.hasher.update(&piece);
        self.bytes_read += piece.len() as u64;
        Ok(Some(piece))
    }

    /// Gather up to `limit` bytes.
    ///
    /// Returns fewer only when the source ends; an empty chunk means the
    /// source was already drained.
    pub async fn read_chunk(&mut self, limit: usize) -> StorageResult<Bytes> {
        let Some(first) = self.next_piece(limit).await? else {
            return Ok(Bytes::new());
        };
        if first.len() == limit {
            return Ok(first);
        }

        let mut buf = BytesMut::from(&first[..]);
        while buf.len() < limit {
            match self.next_piece(limit - buf.len()).await? {
                Some(piece) => buf.extend_from_slice(&piece),
                None => break,
            }
        }
        Ok(buf.freeze())
    }

    /// Whether every byte of the source has been handed out.
    ///
    /// May pull the next piece from the source to find out.
    pub async fn is_at_end(&mut self) -> StorageResult<bool> {
        self.fill().await?;
        Ok(self.pending.is_empty() && self.exhausted)
    }

    /// Digest of the bytes handed out so far.
    pub fn digest(&self) -> UploadDigest {
        UploadDigest {
            size: self.bytes_read,
            checksum: self.hasher.clone().finalize(),
        }
    }

    /// Turn the remaining source into a stream of pieces of at most
    /// `piece_size` bytes.
    ///
    /// The handle receives the digest of everything read, including bytes
    /// handed out before this call, once the stream ends.
    pub fn into_stream(self, piece_size: usize) -> (ByteStream, DigestHandle) {
        let handle = DigestHandle::default();
        let slot = handle.clone();
        let mut reader = self;
        let stream: ByteStream = Box::pin(try_stream! {
            while let Some(piece) = reader.next_piece(piece_size).await? {
                yield piece;
            }
            let _ = slot.0.set(reader.digest());
        });
        (stream, handle)
    }
}

impl std::fmt::Debug for ChecksumReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumReader")
            .field("bytes_read", &self.bytes_read)
            .field("pending", &self.pending.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Hash a download as it is consumed and fail at the end if the contents do
/// not match `expected`.
///
/// Without an expected checksum the stream is passed through untouched.
pub fn verify_stream(stream: ByteStream, key: String, expected: Option<Checksum>) -> ByteStream {
    let Some(expected) = expected else {
        return stream;
    };
    let mut stream = stream;
    Box::pin(try_stream! {
        let mut hasher = Checksum::hasher();
        while let Some(piece) = stream.next().await {
            let piece = piece?;
            hasher.update(&piece);
            yield piece;
        }
        let actual = hasher.finalize();
        if actual != expected {
            Err::<(), StorageError>(StorageError::HashMismatch {
                key,
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            })?;
        }
    })
}
